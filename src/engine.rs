// SPDX-License-Identifier: MPL-2.0

//! Wiring of stores, caches, controllers and the identity machine.

use crate::cache::{ResourceKind, ScoreCache, ScoreSource, UserVoteCache, UserVoteSource};
use crate::config::EngineConfig;
use crate::lock;
use crate::model::{FavoriteSet, Identity, ResourceId, SyncStatus};
use crate::mutation::{FavoriteController, MutationError, MutationGuard, VoteController};
use crate::remote::memory::MemoryBackend;
use crate::remote::supabase::SupabaseBackend;
use crate::remote::{FavoritesService, RemoteResult, VotingService};
use crate::scope::{BatchScope, FavoriteStatus, VoteParts, VoteStatus};
use crate::store::{LocalStore, Preferences};
use crate::sync::{
    IdentityMachine, IdentityProvider, IdentityState, NetworkMonitor, SyncStatusHandle, TokenSink,
    spawn_background_sync, spawn_identity_listener,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// The remote surfaces an engine talks to.
pub struct Remote {
    pub favorites: Arc<dyn FavoritesService>,
    pub voting: Arc<dyn VotingService>,
    /// Told about the access token on every identity change
    pub token_sink: Option<TokenSink>,
}

impl Remote {
    pub fn memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            favorites: backend.clone(),
            voting: backend,
            token_sink: None,
        }
    }

    pub fn supabase(backend: Arc<SupabaseBackend>) -> Self {
        let sink_backend = Arc::clone(&backend);
        Self {
            favorites: backend.clone(),
            voting: backend,
            token_sink: Some(Arc::new(move |token: Option<&str>| {
                sink_backend.set_access_token(token.map(str::to_string));
            })),
        }
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<LocalStore>,
    scores: Arc<ScoreCache>,
    user_votes: Arc<UserVoteCache>,
    votes: Arc<VoteController>,
    favorites: Arc<FavoriteController>,
    identity: Arc<IdentityMachine>,
    status: SyncStatusHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: Arc<LocalStore>, remote: Remote) -> Arc<Self> {
        let scores = ScoreCache::new(
            ResourceKind::Scores,
            config.score_freshness,
            config.batch_window,
            Arc::new(ScoreSource::new(remote.voting.clone())),
        );
        let user_votes = UserVoteCache::new(
            ResourceKind::UserVotes,
            config.user_vote_freshness,
            config.batch_window,
            Arc::new(UserVoteSource::new(remote.voting.clone())),
        );

        // Votes and favorites on the same resource never block each other
        let vote_guard = MutationGuard::new(config.mutation_cooldown);
        let favorite_guard = MutationGuard::new(config.mutation_cooldown);

        let status = SyncStatusHandle::new();
        let mut machine = IdentityMachine::new(
            store.clone(),
            remote.favorites.clone(),
            user_votes.clone(),
            status.clone(),
        )
        .with_favorite_guard(favorite_guard.clone());
        if let Some(sink) = remote.token_sink {
            machine = machine.with_token_sink(sink);
        }
        let identity = Arc::new(machine);

        let votes = Arc::new(VoteController::new(
            remote.voting,
            scores.clone(),
            user_votes.clone(),
            vote_guard,
            identity.subscribe(),
        ));
        let favorites = Arc::new(FavoriteController::new(
            remote.favorites,
            store.clone(),
            favorite_guard,
            identity.subscribe(),
        ));

        Arc::new(Self {
            config,
            store,
            scores,
            user_votes,
            votes,
            favorites,
            identity,
            status,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn favorite_status(&self, resource_id: &str) -> FavoriteStatus {
        FavoriteStatus::new(resource_id, self.favorites.clone())
    }

    /// Vote handle for a widget outside any [`BatchScope`].
    pub fn vote_status(&self, resource_id: &str) -> VoteStatus {
        VoteStatus::standalone(resource_id, self.vote_parts())
    }

    pub fn batch_scope<I, S>(&self, ids: I) -> BatchScope
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceId>,
    {
        BatchScope::new(ids, self.vote_parts())
    }

    pub fn favorites(&self) -> FavoriteSet {
        self.store.favorites()
    }

    /// Remove every favorite, remotely too when signed in.
    pub async fn clear_favorites(&self) -> Result<(), MutationError> {
        self.favorites.clear().await
    }

    pub fn preferences(&self) -> Preferences {
        self.store.preferences()
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        self.store.set_preferences(preferences);
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn identity_state(&self) -> IdentityState {
        self.identity.state()
    }

    pub async fn retry_sync(&self) -> RemoteResult<()> {
        self.identity.retry_sync().await
    }

    /// Full favorites merge plus a refetch of every cached score and vote.
    pub async fn force_sync(&self) -> RemoteResult<()> {
        self.scores.invalidate_all();
        self.user_votes.invalidate_all();
        self.identity.force_sync().await
    }

    pub async fn handle_identity(&self, identity: Identity) {
        self.identity.handle(identity).await;
    }

    /// Follow `provider` for as long as the engine lives.
    pub fn attach_identity(&self, provider: Arc<dyn IdentityProvider>) {
        let task = spawn_identity_listener(self.identity.clone(), provider);
        lock(&self.tasks).push(task);
    }

    /// Start periodic and reconnect-triggered favorites sync.
    pub fn start_background(&self, network: &NetworkMonitor) {
        let task = spawn_background_sync(
            self.identity.clone(),
            network.subscribe(),
            self.config.sync_interval,
        );
        lock(&self.tasks).push(task);
        info!(interval = ?self.config.sync_interval, "background sync started");
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    fn vote_parts(&self) -> VoteParts {
        VoteParts {
            scores: self.scores.clone(),
            user_votes: self.user_votes.clone(),
            controller: self.votes.clone(),
            identity: self.identity.subscribe(),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
