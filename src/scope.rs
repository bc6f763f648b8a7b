// SPDX-License-Identifier: MPL-2.0

//! Handles the UI layer holds per widget and per screen.
//!
//! A [`BatchScope`] is mounted once per screen with every resource ID the
//! screen shows, so all of its widgets share one score fetch and one
//! user-vote fetch. A [`VoteStatus`] created outside any scope falls back to
//! reading its own ID through the same caches.

use crate::cache::{ResourceKind, Scope, ScoreCache, UserVoteCache, canonical_ids};
use crate::model::{ResourceId, ResourceScore, VoteDirection, VoteResult};
use crate::mutation::{FavoriteController, MutationError, VoteController};
use crate::remote::RemoteResult;
use crate::sync::IdentityState;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub(crate) struct VoteParts {
    pub(crate) scores: Arc<ScoreCache>,
    pub(crate) user_votes: Arc<UserVoteCache>,
    pub(crate) controller: Arc<VoteController>,
    pub(crate) identity: watch::Receiver<IdentityState>,
}

impl VoteParts {
    fn user_scope(&self) -> Option<Scope> {
        Scope::for_kind(ResourceKind::UserVotes, &self.identity.borrow().identity)
    }
}

/// Pre-fetches scores and votes for a screen's worth of resources.
#[derive(Clone)]
pub struct BatchScope {
    ids: Arc<[ResourceId]>,
    parts: VoteParts,
}

impl BatchScope {
    pub(crate) fn new<I, S>(ids: I, parts: VoteParts) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceId>,
    {
        Self {
            ids: canonical_ids(ids).into(),
            parts,
        }
    }

    pub fn ids(&self) -> &[ResourceId] {
        &self.ids
    }

    /// Load scores, and votes when signed in, for every ID in one round trip each.
    pub async fn prefetch(&self) -> RemoteResult<()> {
        let shared = Scope::Shared;
        let scores = self.parts.scores.get(&shared, &self.ids);
        match self.parts.user_scope() {
            Some(scope) => {
                let (scores, votes) = tokio::join!(scores, self.parts.user_votes.get(&scope, &self.ids));
                scores?;
                votes?;
            }
            None => {
                scores.await?;
            }
        }
        Ok(())
    }

    pub fn vote_status(&self, resource_id: &str) -> VoteStatus {
        VoteStatus {
            resource_id: resource_id.to_string(),
            batch: Some(Arc::clone(&self.ids)),
            parts: self.parts.clone(),
        }
    }

    pub fn score(&self, resource_id: &str) -> Option<ResourceScore> {
        self.vote_status(resource_id).score()
    }

    pub fn my_vote(&self, resource_id: &str) -> Option<VoteDirection> {
        self.vote_status(resource_id).my_vote()
    }
}

/// Vote state of one resource as a widget sees it.
#[derive(Clone)]
pub struct VoteStatus {
    resource_id: ResourceId,
    /// The screen's ID list when mounted inside a [`BatchScope`]
    batch: Option<Arc<[ResourceId]>>,
    parts: VoteParts,
}

impl VoteStatus {
    pub(crate) fn standalone(resource_id: &str, parts: VoteParts) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            batch: None,
            parts,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Cached score. `None` while the first fetch is pending.
    pub fn score(&self) -> Option<ResourceScore> {
        self.parts
            .scores
            .peek(&Scope::Shared, &self.request_ids())
            .get(&self.resource_id)
            .copied()
    }

    /// The signed-in user's vote. Always `None` when anonymous.
    pub fn my_vote(&self) -> Option<VoteDirection> {
        let scope = self.parts.user_scope()?;
        self.parts
            .user_votes
            .peek(&scope, &self.request_ids())
            .get(&self.resource_id)
            .copied()
            .flatten()
    }

    pub fn is_pending(&self) -> bool {
        self.parts.controller.is_pending(&self.resource_id)
    }

    /// Wait for this resource's score and vote to be loaded.
    pub async fn load(&self) -> RemoteResult<(Option<VoteDirection>, ResourceScore)> {
        let ids = [self.resource_id.clone()];
        let score = self
            .parts
            .scores
            .get(&Scope::Shared, &ids)
            .await?
            .get(&self.resource_id)
            .copied()
            .unwrap_or_default();
        let my_vote = match self.parts.user_scope() {
            Some(scope) => self
                .parts
                .user_votes
                .get(&scope, &ids)
                .await?
                .get(&self.resource_id)
                .copied()
                .flatten(),
            None => None,
        };
        Ok((my_vote, score))
    }

    pub async fn vote(&self, direction: VoteDirection) -> Result<VoteResult, MutationError> {
        self.parts.controller.vote(&self.resource_id, direction).await
    }

    fn request_ids(&self) -> Vec<ResourceId> {
        match &self.batch {
            Some(ids) => ids.to_vec(),
            None => vec![self.resource_id.clone()],
        }
    }
}

/// Favorite state of one resource.
#[derive(Clone)]
pub struct FavoriteStatus {
    resource_id: ResourceId,
    controller: Arc<FavoriteController>,
}

impl FavoriteStatus {
    pub(crate) fn new(resource_id: &str, controller: Arc<FavoriteController>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            controller,
        }
    }

    pub fn is_favorite(&self) -> bool {
        self.controller.is_favorite(&self.resource_id)
    }

    pub fn is_pending(&self) -> bool {
        self.controller.is_pending(&self.resource_id)
    }

    /// Returns whether the resource is a favorite afterwards.
    pub async fn toggle(&self) -> Result<bool, MutationError> {
        self.controller.toggle(&self.resource_id).await
    }
}
