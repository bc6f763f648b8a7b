// SPDX-License-Identifier: MPL-2.0

use crate::cache::{CacheSnapshot, Scope, ScoreCache, UserVoteCache};
use crate::model::{ResourceId, ResourceScore, VoteDirection, VoteResult};
use crate::mutation::{Mutation, MutationError, MutationGuard, Transaction, stable_actor};
use crate::remote::{RemoteError, VotingService};
use crate::sync::IdentityState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Casts votes optimistically against the score and user-vote caches.
pub struct VoteController {
    service: Arc<dyn VotingService>,
    scores: Arc<ScoreCache>,
    user_votes: Arc<UserVoteCache>,
    guard: Arc<MutationGuard>,
    identity: watch::Receiver<IdentityState>,
}

impl VoteController {
    pub fn new(
        service: Arc<dyn VotingService>,
        scores: Arc<ScoreCache>,
        user_votes: Arc<UserVoteCache>,
        guard: Arc<MutationGuard>,
        identity: watch::Receiver<IdentityState>,
    ) -> Self {
        Self {
            service,
            scores,
            user_votes,
            guard,
            identity,
        }
    }

    /// Whether a vote by the current actor on `resource_id` is unsettled.
    pub fn is_pending(&self, resource_id: &str) -> bool {
        let identity = self.identity.borrow();
        match identity.identity.user_id() {
            Some(user_id) => self.guard.is_pending(Some(user_id), resource_id),
            None => false,
        }
    }

    /// Cast `direction` on `resource_id` with toggle semantics.
    ///
    /// Without a signed-in actor nothing is touched and `SignInRequired` is
    /// returned. A second call for the same target before the first settles,
    /// or within the cooldown, is ignored.
    pub async fn vote(
        &self,
        resource_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteResult, MutationError> {
        let Some(user_id) = self.identity.borrow().identity.user_id().map(str::to_string) else {
            return Err(MutationError::SignInRequired);
        };
        let _ticket = self.guard.try_begin(Some(&user_id), resource_id)?;

        let scope = Scope::User(user_id.clone());
        let ids = [resource_id.to_string()];
        let current = self
            .user_votes
            .get(&scope, &ids)
            .await?
            .get(resource_id)
            .copied()
            .flatten();
        let next = direction.toggle(current);
        debug!(resource_id, ?current, ?next, "casting vote");

        let tx = VoteTransaction {
            scores: Arc::clone(&self.scores),
            user_votes: Arc::clone(&self.user_votes),
            scope,
            resource_id: resource_id.to_string(),
            previous: current,
            next,
            score_snapshot: None,
            vote_snapshot: None,
        };
        let dispatch = async {
            stable_actor(&self.identity, &user_id).await?;
            self.service.cast_vote(&user_id, resource_id, direction).await
        };

        let result = Mutation::new("vote", tx).run(dispatch).await;
        if let Ok(settled) = &result {
            info!(resource_id, my_vote = ?settled.my_vote, total = settled.score.total_score(), "vote settled");
        }
        result
    }
}

struct VoteTransaction {
    scores: Arc<ScoreCache>,
    user_votes: Arc<UserVoteCache>,
    scope: Scope,
    resource_id: ResourceId,
    previous: Option<VoteDirection>,
    next: Option<VoteDirection>,
    score_snapshot: Option<CacheSnapshot<ResourceScore>>,
    vote_snapshot: Option<CacheSnapshot<Option<VoteDirection>>>,
}

impl Transaction for VoteTransaction {
    type Output = VoteResult;

    fn apply(&mut self) {
        let (previous, next) = (self.previous, self.next);
        self.vote_snapshot = Some(self.user_votes.patch(&self.scope, &self.resource_id, |_| next));
        self.score_snapshot = Some(self.scores.patch(&Scope::Shared, &self.resource_id, |score| {
            score.with_vote_change(previous, next)
        }));
    }

    fn commit(&mut self, output: &VoteResult) {
        if let Some(snapshot) = self.vote_snapshot.take() {
            self.user_votes.settle(snapshot, output.my_vote);
        }
        if let Some(snapshot) = self.score_snapshot.take() {
            self.scores.settle(snapshot, output.score);
        }
    }

    fn rollback(&mut self, error: &RemoteError) {
        if let Some(snapshot) = self.vote_snapshot.take() {
            self.user_votes.restore(snapshot);
        }
        if let Some(snapshot) = self.score_snapshot.take() {
            self.scores.restore(snapshot);
        }
        // The server may have applied some of the change; refetch instead of trusting the guess
        if error.invalidates_cache() {
            self.user_votes.invalidate(&self.resource_id);
            self.scores.invalidate(&self.resource_id);
        }
    }
}
