// SPDX-License-Identifier: MPL-2.0

//! Bulk fetchers backing the score and user-vote caches.

use crate::cache::batch::BatchFetcher;
use crate::cache::key::Scope;
use crate::model::{ResourceId, ResourceScore, VoteDirection};
use crate::remote::{RemoteError, RemoteResult, VotingService};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ScoreSource {
    service: Arc<dyn VotingService>,
}

impl ScoreSource {
    pub fn new(service: Arc<dyn VotingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl BatchFetcher<ResourceScore> for ScoreSource {
    async fn fetch(&self, _scope: &Scope, ids: &[ResourceId]) -> RemoteResult<HashMap<ResourceId, ResourceScore>> {
        self.service.get_scores(ids).await
    }
}

pub struct UserVoteSource {
    service: Arc<dyn VotingService>,
}

impl UserVoteSource {
    pub fn new(service: Arc<dyn VotingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl BatchFetcher<Option<VoteDirection>> for UserVoteSource {
    async fn fetch(
        &self,
        scope: &Scope,
        ids: &[ResourceId],
    ) -> RemoteResult<HashMap<ResourceId, Option<VoteDirection>>> {
        let Scope::User(voter_id) = scope else {
            return Err(RemoteError::NotAuthenticated);
        };
        let votes = self.service.get_user_votes(voter_id, ids).await?;
        Ok(votes.into_iter().map(|(id, direction)| (id, Some(direction))).collect())
    }
}
