// SPDX-License-Identifier: MPL-2.0

//! In-memory backend implementing both remote surfaces.
//!
//! # Purpose
//! Stands in for the hosted database during development, in tests and in the
//! binary when no backend is configured. Tables are `HashMap`s guarded by
//! `tokio::sync::RwLock`; nothing is durable.
//!
//! # Test hooks
//! Call counters, an injectable failure for the next write, sticky read
//! failures and artificial latency make concurrency and rollback paths
//! observable.

use super::{
    FavoritesService, RateDecision, RateLimitOracle, RemoteError, RemoteResult, VotingService,
};
use crate::lock;
use crate::model::{
    FavoriteSet, ResourceId, ResourceScore, UserId, VoteDirection, VoteRecord, VoteResult,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_writes` per actor per `window`.
pub struct WindowRateLimiter {
    max_writes: usize,
    window: Duration,
    history: Mutex<HashMap<UserId, VecDeque<Instant>>>,
}

impl WindowRateLimiter {
    pub fn new(max_writes: usize, window: Duration) -> Self {
        Self {
            max_writes,
            window,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter that never refuses.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, Duration::from_secs(1))
    }
}

#[async_trait]
impl RateLimitOracle for WindowRateLimiter {
    async fn can_actor_mutate_now(&self, actor_id: &str) -> RemoteResult<RateDecision> {
        let now = Instant::now();
        let mut history = lock(&self.history);
        let writes = history.entry(actor_id.to_string()).or_default();
        while writes
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            writes.pop_front();
        }
        if writes.len() >= self.max_writes {
            let oldest = writes.front().copied().unwrap_or(now);
            let remaining = self.window.saturating_sub(now.duration_since(oldest));
            // Round up so a caller never retries a moment too early
            let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Ok(RateDecision::CoolDown {
                seconds: seconds.max(1),
            });
        }
        writes.push_back(now);
        Ok(RateDecision::Allowed)
    }
}

#[derive(Default)]
struct Tables {
    favorites: HashMap<UserId, FavoriteSet>,
    votes: HashMap<(ResourceId, UserId), VoteRecord>,
    scores: HashMap<ResourceId, ResourceScore>,
}

#[derive(Default)]
struct Faults {
    next_write: Option<RemoteError>,
    reads: Option<RemoteError>,
    read_latency: Option<Duration>,
    write_latency: Option<Duration>,
}

#[derive(Default)]
struct Calls {
    get_favorites: AtomicUsize,
    add_favorite: AtomicUsize,
    remove_favorite: AtomicUsize,
    cast_vote: AtomicUsize,
    get_scores: AtomicUsize,
    get_user_votes: AtomicUsize,
}

pub struct MemoryBackend {
    tables: RwLock<Tables>,
    oracle: Arc<dyn RateLimitOracle>,
    faults: Mutex<Faults>,
    calls: Calls,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_oracle(Arc::new(WindowRateLimiter::unlimited()))
    }

    pub fn with_oracle(oracle: Arc<dyn RateLimitOracle>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            oracle,
            faults: Mutex::new(Faults::default()),
            calls: Calls::default(),
        }
    }

    pub async fn seed_score(&self, resource_id: &str, score: ResourceScore) {
        self.tables
            .write()
            .await
            .scores
            .insert(resource_id.to_string(), score);
    }

    pub async fn seed_favorites<'a>(&self, user_id: &str, ids: impl IntoIterator<Item = &'a str>) {
        let mut tables = self.tables.write().await;
        let set = tables.favorites.entry(user_id.to_string()).or_default();
        for id in ids {
            set.insert(id);
        }
    }

    /// Record an existing vote without touching the counters.
    pub async fn seed_vote(&self, voter_id: &str, resource_id: &str, direction: VoteDirection) {
        self.tables.write().await.votes.insert(
            (resource_id.to_string(), voter_id.to_string()),
            VoteRecord {
                resource_id: resource_id.to_string(),
                voter_id: voter_id.to_string(),
                direction,
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn favorites_of(&self, user_id: &str) -> FavoriteSet {
        self.tables
            .read()
            .await
            .favorites
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn score_of(&self, resource_id: &str) -> ResourceScore {
        self.tables
            .read()
            .await
            .scores
            .get(resource_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn vote_count(&self) -> usize {
        self.tables.read().await.votes.len()
    }

    /// Fail the next write with `error`.
    pub fn fail_next_write(&self, error: RemoteError) {
        lock(&self.faults).next_write = Some(error);
    }

    /// Fail every read with `error` until cleared with `None`.
    pub fn fail_reads(&self, error: Option<RemoteError>) {
        lock(&self.faults).reads = error;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        let mut faults = lock(&self.faults);
        faults.read_latency = latency;
        faults.write_latency = latency;
    }

    /// Delay only writes, leaving reads instant.
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        lock(&self.faults).write_latency = latency;
    }

    pub fn get_scores_calls(&self) -> usize {
        self.calls.get_scores.load(Ordering::SeqCst)
    }

    pub fn get_user_votes_calls(&self) -> usize {
        self.calls.get_user_votes.load(Ordering::SeqCst)
    }

    pub fn cast_vote_calls(&self) -> usize {
        self.calls.cast_vote.load(Ordering::SeqCst)
    }

    pub fn get_favorites_calls(&self) -> usize {
        self.calls.get_favorites.load(Ordering::SeqCst)
    }

    pub fn add_favorite_calls(&self) -> usize {
        self.calls.add_favorite.load(Ordering::SeqCst)
    }

    pub fn remove_favorite_calls(&self) -> usize {
        self.calls.remove_favorite.load(Ordering::SeqCst)
    }

    async fn before_read(&self, counter: &AtomicUsize) -> RemoteResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let (latency, failure) = {
            let faults = lock(&self.faults);
            (faults.read_latency, faults.reads.clone())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        failure.map_or(Ok(()), Err)
    }

    async fn before_write(&self, counter: &AtomicUsize) -> RemoteResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let (latency, failure) = {
            let mut faults = lock(&self.faults);
            (faults.write_latency, faults.next_write.take())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        failure.map_or(Ok(()), Err)
    }

    fn require_user(user_id: &str) -> RemoteResult<()> {
        if user_id.is_empty() {
            return Err(RemoteError::NotAuthenticated);
        }
        Ok(())
    }
}

#[async_trait]
impl FavoritesService for MemoryBackend {
    async fn get_favorites(&self, user_id: &str) -> RemoteResult<FavoriteSet> {
        Self::require_user(user_id)?;
        self.before_read(&self.calls.get_favorites).await?;
        Ok(self.favorites_of(user_id).await)
    }

    async fn add_favorite(&self, user_id: &str, resource_id: &str) -> RemoteResult<bool> {
        Self::require_user(user_id)?;
        self.before_write(&self.calls.add_favorite).await?;
        let mut tables = self.tables.write().await;
        // Duplicate inserts are no-ops
        tables
            .favorites
            .entry(user_id.to_string())
            .or_default()
            .insert(resource_id);
        Ok(true)
    }

    async fn remove_favorite(&self, user_id: &str, resource_id: &str) -> RemoteResult<bool> {
        Self::require_user(user_id)?;
        self.before_write(&self.calls.remove_favorite).await?;
        let mut tables = self.tables.write().await;
        if let Some(set) = tables.favorites.get_mut(user_id) {
            set.remove(resource_id);
        }
        Ok(false)
    }

    async fn clear_favorites(&self, user_id: &str) -> RemoteResult<()> {
        Self::require_user(user_id)?;
        self.before_write(&self.calls.remove_favorite).await?;
        self.tables.write().await.favorites.remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl VotingService for MemoryBackend {
    async fn cast_vote(
        &self,
        voter_id: &str,
        resource_id: &str,
        direction: VoteDirection,
    ) -> RemoteResult<VoteResult> {
        Self::require_user(voter_id)?;
        self.before_write(&self.calls.cast_vote).await?;
        if let RateDecision::CoolDown { seconds } = self.oracle.can_actor_mutate_now(voter_id).await? {
            return Err(RemoteError::RateLimited {
                cooldown_seconds: seconds,
            });
        }

        let mut tables = self.tables.write().await;
        let key = (resource_id.to_string(), voter_id.to_string());
        let previous = tables.votes.get(&key).map(|record| record.direction);
        let next = direction.toggle(previous);

        match next {
            Some(direction) => {
                tables.votes.insert(
                    key,
                    VoteRecord {
                        resource_id: resource_id.to_string(),
                        voter_id: voter_id.to_string(),
                        direction,
                        updated_at: Utc::now(),
                    },
                );
            }
            None => {
                tables.votes.remove(&key);
            }
        }

        let score = tables.scores.entry(resource_id.to_string()).or_default();
        *score = score.with_vote_change(previous, next);

        Ok(VoteResult {
            my_vote: next,
            score: *score,
        })
    }

    async fn get_scores(&self, ids: &[ResourceId]) -> RemoteResult<HashMap<ResourceId, ResourceScore>> {
        self.before_read(&self.calls.get_scores).await?;
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.scores.get(id).map(|score| (id.clone(), *score)))
            .collect())
    }

    async fn get_user_votes(
        &self,
        voter_id: &str,
        ids: &[ResourceId],
    ) -> RemoteResult<HashMap<ResourceId, VoteDirection>> {
        Self::require_user(voter_id)?;
        self.before_read(&self.calls.get_user_votes).await?;
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                tables
                    .votes
                    .get(&(id.clone(), voter_id.to_string()))
                    .map(|record| (id.clone(), record.direction))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vote_toggle_keeps_one_record_per_pair() {
        let backend = MemoryBackend::new();
        backend.seed_score("r1", ResourceScore::new(4, 0, 0)).await;

        let up = backend
            .cast_vote("alice", "r1", VoteDirection::Up)
            .await
            .expect("up");
        assert_eq!(up.my_vote, Some(VoteDirection::Up));
        assert_eq!(up.score.upvotes, 5);

        let down = backend
            .cast_vote("alice", "r1", VoteDirection::Down)
            .await
            .expect("down");
        assert_eq!(down.my_vote, Some(VoteDirection::Down));
        assert_eq!((down.score.upvotes, down.score.downvotes), (4, 1));
        assert_eq!(backend.vote_count().await, 1);

        let cleared = backend
            .cast_vote("alice", "r1", VoteDirection::Down)
            .await
            .expect("clear");
        assert_eq!(cleared.my_vote, None);
        assert_eq!(cleared.score, ResourceScore::new(4, 0, 0));
        assert_eq!(backend.vote_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_favorite_is_noop() {
        let backend = MemoryBackend::new();
        backend.add_favorite("alice", "x").await.expect("add");
        backend.add_favorite("alice", "x").await.expect("add again");
        backend.remove_favorite("alice", "missing").await.expect("remove missing");
        assert_eq!(backend.favorites_of("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn merge_with_local_is_additive_union() {
        let backend = MemoryBackend::new();
        backend.seed_favorites("alice", ["y", "z"]).await;
        let local: FavoriteSet = ["x", "y"].into_iter().collect();

        let merged = backend
            .merge_with_local("alice", &local)
            .await
            .expect("merge");
        let expected: FavoriteSet = ["x", "y", "z"].into_iter().collect();
        assert_eq!(merged, expected);
        assert_eq!(backend.favorites_of("alice").await, expected);
        assert_eq!(backend.add_favorite_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_reports_remaining_cooldown() {
        let oracle = Arc::new(WindowRateLimiter::new(2, Duration::from_secs(30)));
        let backend = MemoryBackend::with_oracle(oracle);

        backend.cast_vote("alice", "a", VoteDirection::Up).await.expect("first");
        backend.cast_vote("alice", "b", VoteDirection::Up).await.expect("second");
        tokio::time::advance(Duration::from_secs(5)).await;

        let err = backend
            .cast_vote("alice", "c", VoteDirection::Up)
            .await
            .expect_err("limited");
        assert_eq!(err, RemoteError::RateLimited { cooldown_seconds: 25 });

        backend.cast_vote("bob", "c", VoteDirection::Up).await.expect("other actor");

        tokio::time::advance(Duration::from_secs(25)).await;
        backend.cast_vote("alice", "c", VoteDirection::Up).await.expect("after cooldown");
    }

    #[tokio::test]
    async fn anonymous_voter_is_rejected() {
        let backend = MemoryBackend::new();
        let err = backend
            .cast_vote("", "r1", VoteDirection::Up)
            .await
            .expect_err("anonymous");
        assert_eq!(err, RemoteError::NotAuthenticated);
        assert_eq!(backend.cast_vote_calls(), 0);
    }
}
