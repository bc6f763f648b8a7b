// SPDX-License-Identifier: MPL-2.0

//! Boundary to the hosted backend.
//!
//! Two surfaces are consumed by the engine: favorites and voting. Both are
//! traits so the engine never sees transport details. Every write is an
//! upsert or toggle at the storage layer: re-adding an existing favorite or
//! removing a missing one succeeds without effect.

pub mod memory;
pub mod supabase;

use crate::model::{FavoriteSet, ResourceId, ResourceScore, VoteDirection, VoteResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("rate limited, retry in {cooldown_seconds}s")]
    RateLimited { cooldown_seconds: u64 },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    /// Whether the true server state may differ from anything cached locally.
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. } | RemoteError::Conflict(_)
        )
    }

    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { cooldown_seconds } => {
                Some(Duration::from_secs(*cooldown_seconds))
            }
            _ => None,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote favorites for one user.
#[async_trait]
pub trait FavoritesService: Send + Sync {
    async fn get_favorites(&self, user_id: &str) -> RemoteResult<FavoriteSet>;

    /// Returns whether `resource_id` is a favorite afterwards.
    async fn add_favorite(&self, user_id: &str, resource_id: &str) -> RemoteResult<bool>;

    /// Returns whether `resource_id` is a favorite afterwards.
    async fn remove_favorite(&self, user_id: &str, resource_id: &str) -> RemoteResult<bool>;

    async fn clear_favorites(&self, user_id: &str) -> RemoteResult<()>;

    /// Additively persist `local` and return the union with the remote set.
    ///
    /// Never removes a remote favorite.
    async fn merge_with_local(
        &self,
        user_id: &str,
        local: &FavoriteSet,
    ) -> RemoteResult<FavoriteSet> {
        let remote = self.get_favorites(user_id).await?;
        let missing: Vec<ResourceId> = local.difference(&remote).cloned().collect();
        for resource_id in &missing {
            self.add_favorite(user_id, resource_id).await?;
        }
        Ok(remote.union(local))
    }
}

/// Remote votes and score aggregates.
#[async_trait]
pub trait VotingService: Send + Sync {
    /// Cast `direction` with toggle semantics and return the resulting state.
    ///
    /// Implementations consult the rate-limit oracle before writing.
    async fn cast_vote(
        &self,
        voter_id: &str,
        resource_id: &str,
        direction: VoteDirection,
    ) -> RemoteResult<VoteResult>;

    /// Bulk score lookup. IDs without a score row may be omitted.
    async fn get_scores(&self, ids: &[ResourceId]) -> RemoteResult<HashMap<ResourceId, ResourceScore>>;

    /// Bulk lookup of one voter's votes. IDs without a vote are omitted.
    async fn get_user_votes(
        &self,
        voter_id: &str,
        ids: &[ResourceId],
    ) -> RemoteResult<HashMap<ResourceId, VoteDirection>>;
}

/// Answer from the rate-limit oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    CoolDown { seconds: u64 },
}

/// Remote predicate deciding whether an actor may write a vote now.
#[async_trait]
pub trait RateLimitOracle: Send + Sync {
    async fn can_actor_mutate_now(&self, actor_id: &str) -> RemoteResult<RateDecision>;
}
