// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use listing_sync::config::{APP_NAME, ConfigError, SupabaseConfig};
use listing_sync::logging::init_logging;
use listing_sync::remote::memory::MemoryBackend;
use listing_sync::remote::supabase::SupabaseBackend;
use listing_sync::store::{JsonFilePersistence, LocalStore, Persistence, PersistenceError, SqlitePersistence};
use listing_sync::{EngineConfig, Identity, MutationError, Remote, RemoteError, SyncEngine, VoteDirection, runtime};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Act as this signed-in user instead of anonymously
    #[arg(short, long)]
    user: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "LISTING_SYNC_ACCESS_TOKEN")]
    token: Option<String>,

    /// Local state file (defaults to the user config directory)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Keep local state in SQLite instead of a JSON file
    #[arg(long)]
    sqlite: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the sync status and local favorites
    Status,
    /// Toggle a favorite
    Favorite { id: String },
    /// Remove every favorite
    ClearFavorites,
    /// Cast a vote: same direction again clears it
    Vote {
        id: String,
        #[arg(value_parser = parse_direction)]
        direction: VoteDirection,
    },
    /// Show scores for several resources with one request
    Scores {
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,
    },
    /// Retry favorites sync
    Sync,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

fn parse_direction(s: &str) -> Result<VoteDirection, String> {
    s.parse()
}

fn open_store(args: &Args) -> Result<Arc<LocalStore>, CliError> {
    let backend: Arc<dyn Persistence> = match (&args.state, args.sqlite) {
        (Some(path), true) => Arc::new(SqlitePersistence::open(path)?),
        (None, true) => Arc::new(SqlitePersistence::open_default()?),
        (Some(path), false) => Arc::new(JsonFilePersistence::new(path)),
        (None, false) => Arc::new(JsonFilePersistence::default_location()?),
    };
    Ok(Arc::new(LocalStore::load(backend)))
}

fn remote() -> Result<Remote, CliError> {
    match SupabaseConfig::from_env() {
        Ok(config) => {
            info!(url = %config.supabase_url, "using Supabase backend");
            Ok(Remote::supabase(Arc::new(SupabaseBackend::new(config))))
        }
        Err(ConfigError::Missing(name)) => {
            info!(missing = name, "no backend configured, using in-memory backend");
            Ok(Remote::memory(Arc::new(MemoryBackend::new())))
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let config = EngineConfig::from_env()?;
    let engine = SyncEngine::new(config, open_store(&args)?, remote()?);

    if let Some(user_id) = args.user.clone() {
        engine
            .handle_identity(Identity::SignedIn {
                user_id,
                access_token: args.token.clone(),
            })
            .await;
    }

    match args.command {
        Command::Status => {
            let status = engine.sync_status();
            println!("signed in:   {}", status.is_signed_in);
            println!("online:      {}", status.is_online);
            match status.last_synced_at {
                Some(at) => println!("last synced: {}", at.to_rfc3339()),
                None => println!("last synced: never"),
            }
            if let Some(error) = status.error {
                println!("error:       {error}");
            }
            println!("identity:    {:?}", engine.identity_state().phase);
            let favorites = engine.favorites();
            let names: Vec<&str> = favorites.iter().map(String::as_str).collect();
            println!("favorites:   {}", names.join(", "));
            println!("layout:      {}", engine.preferences().layout.label());
        }
        Command::Favorite { id } => {
            let now = engine.favorite_status(&id).toggle().await?;
            println!("{id}: {}", if now { "favorite" } else { "not favorite" });
        }
        Command::ClearFavorites => {
            engine.clear_favorites().await?;
            println!("favorites cleared");
        }
        Command::Vote { id, direction } => match engine.vote_status(&id).vote(direction).await {
            Ok(result) => {
                let vote = result.my_vote.map_or("none", VoteDirection::as_str);
                println!(
                    "{id}: my vote {vote}, +{} -{} (total {})",
                    result.score.upvotes,
                    result.score.downvotes,
                    result.score.total_score()
                );
            }
            Err(e) if e.is_ignored() => println!("{id}: vote ignored ({e})"),
            Err(e) => return Err(e.into()),
        },
        Command::Scores { ids } => {
            let scope = engine.batch_scope(ids.iter().cloned());
            scope.prefetch().await?;
            for id in scope.ids() {
                let score = scope.score(id).unwrap_or_default();
                let mine = scope.my_vote(id).map_or("", |vote| match vote {
                    VoteDirection::Up => " (you: up)",
                    VoteDirection::Down => " (you: down)",
                });
                println!("{id}: {}{mine}", score.total_score());
            }
        }
        Command::Sync => {
            engine.retry_sync().await?;
            println!("synced");
        }
    }

    engine.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();
    info!(app = APP_NAME, version = env!("CARGO_PKG_VERSION"), "starting");
    match runtime::block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
