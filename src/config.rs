// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;
use thiserror::Error;

pub const APP_ID: &str = "io.github.listing-sync";
pub const APP_NAME: &str = "Listing Sync";

#[cfg(feature = "devel")]
pub const IS_DEVEL: bool = true;
#[cfg(not(feature = "devel"))]
pub const IS_DEVEL: bool = false;

/// Used when a rate-limit rejection carries no explicit cooldown
pub const DEFAULT_RATE_LIMIT_COOLDOWN_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("missing {0}")]
    Missing(&'static str),
}

/// Timing knobs for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long aggregate scores are served without revalidation
    pub score_freshness: Duration,
    /// How long a user's own votes are served without revalidation
    pub user_vote_freshness: Duration,
    /// Minimum gap between two accepted mutations on the same target
    pub mutation_cooldown: Duration,
    /// Period of background favorites reconciliation while signed in
    pub sync_interval: Duration,
    /// How long the batch cache collects IDs before issuing one fetch
    pub batch_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            score_freshness: Duration::from_secs(60),
            user_vote_freshness: Duration::from_secs(30),
            mutation_cooldown: Duration::from_millis(500),
            sync_interval: Duration::from_secs(5 * 60),
            batch_window: Duration::from_millis(10),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LISTING_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let duration = |name: &'static str, unit: fn(u64) -> Duration| {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map(unit)
                        .map_err(|_| ConfigError::Invalid { name, value })
                })
                .transpose()
        };

        if let Some(v) = duration("LISTING_SYNC_SCORE_FRESHNESS_SECS", Duration::from_secs)? {
            config.score_freshness = v;
        }
        if let Some(v) = duration("LISTING_SYNC_USER_VOTE_FRESHNESS_SECS", Duration::from_secs)? {
            config.user_vote_freshness = v;
        }
        if let Some(v) = duration("LISTING_SYNC_MUTATION_COOLDOWN_MS", Duration::from_millis)? {
            config.mutation_cooldown = v;
        }
        if let Some(v) = duration("LISTING_SYNC_INTERVAL_SECS", Duration::from_secs)? {
            if v.is_zero() {
                return Err(ConfigError::Invalid {
                    name: "LISTING_SYNC_INTERVAL_SECS",
                    value: "0".into(),
                });
            }
            config.sync_interval = v;
        }
        if let Some(v) = duration("LISTING_SYNC_BATCH_WINDOW_MS", Duration::from_millis)? {
            config.batch_window = v;
        }
        Ok(config)
    }
}

/// Connection settings for a Supabase project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl SupabaseConfig {
    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let supabase_url =
            std::env::var("SUPABASE_URL").map_err(|_| ConfigError::Missing("SUPABASE_URL"))?;
        let supabase_anon_key = std::env::var("SUPABASE_ANON_KEY")
            .map_err(|_| ConfigError::Missing("SUPABASE_ANON_KEY"))?;
        url::Url::parse(&supabase_url).map_err(|_| ConfigError::Invalid {
            name: "SUPABASE_URL",
            value: supabase_url.clone(),
        })?;
        Ok(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_anon_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.score_freshness, Duration::from_secs(60));
        assert_eq!(config.user_vote_freshness, Duration::from_secs(30));
    }

    #[test]
    fn overrides_apply_units() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("LISTING_SYNC_MUTATION_COOLDOWN_MS", "250"),
            ("LISTING_SYNC_INTERVAL_SECS", "30"),
        ]))
        .expect("config");
        assert_eq!(config.mutation_cooldown, Duration::from_millis(250));
        assert_eq!(config.sync_interval, Duration::from_secs(30));
    }

    #[test]
    fn rejects_garbage_and_zero_interval() {
        let err = EngineConfig::from_lookup(lookup(&[("LISTING_SYNC_BATCH_WINDOW_MS", "soon")]))
            .expect_err("garbage");
        assert!(matches!(err, ConfigError::Invalid { name: "LISTING_SYNC_BATCH_WINDOW_MS", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("LISTING_SYNC_INTERVAL_SECS", "0")]))
            .expect_err("zero");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
