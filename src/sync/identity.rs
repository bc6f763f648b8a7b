// SPDX-License-Identifier: MPL-2.0

//! Identity transitions and favorite reconciliation.
//!
//! While anonymous the local store owns the favorite set. Signing in runs one
//! union merge with the remote set, after which the remote store is the
//! authority and local state is a write-through cache of it. Signing out keeps
//! the favorites locally and stops syncing.

use crate::cache::{Scope, UserVoteCache};
use crate::model::{FavoriteSet, Identity};
use crate::mutation::MutationGuard;
use crate::remote::{FavoritesService, RemoteResult};
use crate::store::LocalStore;
use crate::sync::SyncStatusHandle;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentityPhase {
    #[default]
    Anonymous,
    /// Sign-in reconciliation is running; remote writes wait for it
    Transitioning,
    SignedIn,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityState {
    pub phase: IdentityPhase,
    pub identity: Identity,
}

/// Why a favorites sync runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Periodic,
    Reconnect,
    /// Explicit retry by the user
    Manual,
    /// Full merge regardless of earlier reconciliation
    Forced,
}

impl SyncTrigger {
    /// Background failures are logged, never shown.
    fn is_background(self) -> bool {
        matches!(self, SyncTrigger::Periodic | SyncTrigger::Reconnect)
    }
}

/// Receives the bearer token whenever the identity changes.
pub type TokenSink = Arc<dyn Fn(Option<&str>) + Send + Sync>;

pub struct IdentityMachine {
    store: Arc<LocalStore>,
    favorites: Arc<dyn FavoritesService>,
    user_votes: Arc<UserVoteCache>,
    status: SyncStatusHandle,
    state: watch::Sender<IdentityState>,
    /// Set once the sign-in merge ran; cleared whenever sync goes offline
    reconciled: AtomicBool,
    /// Serializes identity transitions
    transition: Mutex<()>,
    /// Serializes favorite syncs
    sync: Mutex<()>,
    token_sink: Option<TokenSink>,
    /// Claims of favorite writes still in flight
    favorite_guard: Option<Arc<MutationGuard>>,
}

impl IdentityMachine {
    pub fn new(
        store: Arc<LocalStore>,
        favorites: Arc<dyn FavoritesService>,
        user_votes: Arc<UserVoteCache>,
        status: SyncStatusHandle,
    ) -> Self {
        let (state, _) = watch::channel(IdentityState::default());
        Self {
            store,
            favorites,
            user_votes,
            status,
            state,
            reconciled: AtomicBool::new(false),
            transition: Mutex::new(()),
            sync: Mutex::new(()),
            token_sink: None,
            favorite_guard: None,
        }
    }

    pub fn with_token_sink(mut self, sink: TokenSink) -> Self {
        self.token_sink = Some(sink);
        self
    }

    /// Keep the optimistic state of favorite writes claimed in `guard` when
    /// a sync adopts the remote set.
    pub fn with_favorite_guard(mut self, guard: Arc<MutationGuard>) -> Self {
        self.favorite_guard = Some(guard);
        self
    }

    pub fn state(&self) -> IdentityState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IdentityState> {
        self.state.subscribe()
    }

    pub fn is_signed_in(&self) -> bool {
        self.state.borrow().identity.is_signed_in()
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::SeqCst)
    }

    /// React to the identity provider reporting `identity`.
    pub async fn handle(&self, identity: Identity) {
        let _transition = self.transition.lock().await;
        if let Some(sink) = &self.token_sink {
            sink(identity.access_token());
        }

        let current = self.state.borrow().identity.clone();
        let same_user = current.user_id() == identity.user_id();
        match (current.is_signed_in(), identity.is_signed_in()) {
            (true, true) if same_user => {
                // Token refresh only
                self.state.send_modify(|state| state.identity = identity);
            }
            (true, true) => {
                self.sign_out();
                self.sign_in(identity).await;
            }
            (false, true) => self.sign_in(identity).await,
            (true, false) => self.sign_out(),
            (false, false) => {}
        }
    }

    async fn sign_in(&self, identity: Identity) {
        let Some(user_id) = identity.user_id().map(str::to_string) else {
            return;
        };
        info!(user_id = %user_id, "identity transition started");
        self.state.send_replace(IdentityState {
            phase: IdentityPhase::Transitioning,
            identity,
        });
        self.status.set_signed_in(true);

        if self.reconciled.swap(true, Ordering::SeqCst) {
            debug!("sign-in already reconciled");
        } else if let Err(e) = self.reconcile(&user_id).await {
            self.reconciled.store(false, Ordering::SeqCst);
            warn!(error = %e, "sign-in reconciliation failed");
            self.status.set_error(Some(e.to_string()));
        }

        self.state.send_modify(|state| state.phase = IdentityPhase::SignedIn);
    }

    fn sign_out(&self) {
        let previous = self.state.borrow().identity.user_id().map(str::to_string);
        self.state.send_replace(IdentityState::default());
        self.reconciled.store(false, Ordering::SeqCst);
        self.status.reset();
        self.store.set_last_synced_at(None);
        self.store.set_error(None);

        // Vote projections belong to the identity; favorites stay on this device
        if let Some(user_id) = previous {
            self.user_votes.remove_scope(&Scope::User(user_id));
        }
        info!(favorites = self.store.favorites().len(), "signed out, favorites kept locally");
    }

    /// Sync favorites with the remote store.
    ///
    /// Until the sign-in merge has succeeded this runs the merge; afterwards
    /// it adopts the remote set, keeping local edits made while it ran.
    pub async fn sync_favorites(&self, trigger: SyncTrigger) -> RemoteResult<()> {
        let state = self.state();
        let Some(user_id) = state.identity.user_id() else {
            debug!(?trigger, "not signed in, skipping sync");
            return Ok(());
        };
        if state.phase == IdentityPhase::Transitioning {
            debug!(?trigger, "transition in progress, skipping sync");
            return Ok(());
        }

        let merge = trigger == SyncTrigger::Forced || !self.reconciled.swap(true, Ordering::SeqCst);
        let result = if merge {
            let result = self.reconcile(user_id).await;
            if result.is_err() {
                self.reconciled.store(false, Ordering::SeqCst);
            }
            result
        } else {
            self.pull(user_id).await
        };

        match &result {
            Ok(()) => debug!(?trigger, merge, "favorites synced"),
            Err(e) if trigger.is_background() => {
                warn!(?trigger, error = %e, "background sync failed, retrying on next tick");
            }
            Err(e) => {
                warn!(?trigger, error = %e, "sync failed");
                self.status.set_error(Some(e.to_string()));
            }
        }
        result
    }

    /// Clear the error and sync again.
    pub async fn retry_sync(&self) -> RemoteResult<()> {
        self.status.set_error(None);
        self.store.set_error(None);
        self.sync_favorites(SyncTrigger::Manual).await
    }

    pub async fn force_sync(&self) -> RemoteResult<()> {
        self.sync_favorites(SyncTrigger::Forced).await
    }

    /// The network dropped: sync is offline and the next reconnect merges again.
    pub fn mark_offline(&self) {
        self.reconciled.store(false, Ordering::SeqCst);
        self.status.mark_offline();
    }

    async fn reconcile(&self, user_id: &str) -> RemoteResult<()> {
        let _sync = self.sync.lock().await;
        self.store.set_loading(true);
        let base = self.store.favorites();
        let merged = self.favorites.merge_with_local(user_id, &base).await;
        self.store.set_loading(false);

        let merged = merged?;
        if self.adopt(user_id, &merged, &base) {
            info!(favorites = merged.len(), "favorites reconciled");
        }
        Ok(())
    }

    async fn pull(&self, user_id: &str) -> RemoteResult<()> {
        let _sync = self.sync.lock().await;
        let base = self.store.favorites();
        let remote = self.favorites.get_favorites(user_id).await?;
        self.adopt(user_id, &remote, &base);
        Ok(())
    }

    /// Replace local favorites with `remote`, replaying edits made since `base` was read.
    fn adopt(&self, user_id: &str, remote: &FavoriteSet, base: &FavoriteSet) -> bool {
        if self.state.borrow().identity.user_id() != Some(user_id) {
            debug!("identity changed during sync, discarding result");
            return false;
        }
        let current = self.store.favorites();
        let mut next = FavoriteSet::rebase(remote, base, &current);
        // Unsettled writes are not in `remote` yet
        if let Some(guard) = &self.favorite_guard {
            for resource_id in guard.pending_for(Some(user_id)) {
                next.set(&resource_id, current.contains(&resource_id));
            }
        }
        self.store.mutate_favorites(next);
        let now = Utc::now();
        self.store.set_last_synced_at(Some(now));
        self.status.mark_synced(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ResourceKind, UserVoteSource};
    use crate::model::VoteDirection;
    use crate::mutation::FavoriteController;
    use crate::remote::RemoteError;
    use crate::remote::memory::MemoryBackend;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Harness {
        backend: Arc<MemoryBackend>,
        store: Arc<LocalStore>,
        user_votes: Arc<UserVoteCache>,
        status: SyncStatusHandle,
        guard: Arc<MutationGuard>,
        machine: IdentityMachine,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(LocalStore::in_memory());
        let user_votes = UserVoteCache::new(
            ResourceKind::UserVotes,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Arc::new(UserVoteSource::new(backend.clone())),
        );
        let status = SyncStatusHandle::new();
        let guard = MutationGuard::new(Duration::ZERO);
        let machine = IdentityMachine::new(store.clone(), backend.clone(), user_votes.clone(), status.clone())
            .with_favorite_guard(guard.clone());
        Harness {
            backend,
            store,
            user_votes,
            status,
            guard,
            machine,
        }
    }

    fn set(ids: &[&str]) -> FavoriteSet {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn sign_in_merges_local_and_remote() {
        let h = harness();
        h.store.mutate_favorites(set(&["x", "y"]));
        h.backend.seed_favorites("alice", ["y", "z"]).await;

        h.machine.handle(Identity::signed_in("alice")).await;

        assert_eq!(h.store.favorites(), set(&["x", "y", "z"]));
        assert!(h.backend.favorites_of("alice").await.contains("x"));
        assert_eq!(h.machine.state().phase, IdentityPhase::SignedIn);
        assert!(h.machine.is_reconciled());

        let status = h.status.get();
        assert!(status.is_online);
        assert!(status.is_signed_in);
        assert!(status.last_synced_at.is_some());
        assert_eq!(h.store.last_synced_at(), status.last_synced_at);
    }

    #[tokio::test]
    async fn repeated_sign_in_event_merges_once() {
        let h = harness();
        h.machine.handle(Identity::signed_in("alice")).await;
        h.machine
            .handle(Identity::SignedIn {
                user_id: "alice".into(),
                access_token: Some("refreshed".into()),
            })
            .await;

        assert_eq!(h.backend.get_favorites_calls(), 1);
        assert_eq!(h.machine.state().identity.access_token(), Some("refreshed"));
    }

    #[tokio::test]
    async fn sign_out_keeps_favorites_and_drops_vote_projection() {
        let h = harness();
        h.backend.seed_favorites("alice", ["a"]).await;
        h.machine.handle(Identity::signed_in("alice")).await;
        h.user_votes.prime(
            &Scope::User("alice".into()),
            HashMap::from([("a".to_string(), Some(VoteDirection::Up))]),
        );

        h.machine.handle(Identity::Anonymous).await;

        assert_eq!(h.store.favorites(), set(&["a"]));
        assert_eq!(h.status.get(), Default::default());
        assert_eq!(h.store.last_synced_at(), None);
        assert!(h.user_votes.is_empty());
        assert!(!h.machine.is_reconciled());
        assert_eq!(h.machine.state(), IdentityState::default());
    }

    #[tokio::test]
    async fn signing_in_again_merges_again() {
        let h = harness();
        h.machine.handle(Identity::signed_in("alice")).await;
        h.machine.handle(Identity::Anonymous).await;
        h.store.set_favorite("offline-pick", true);
        h.machine.handle(Identity::signed_in("alice")).await;

        assert_eq!(h.backend.get_favorites_calls(), 2);
        assert!(h.backend.favorites_of("alice").await.contains("offline-pick"));
    }

    #[tokio::test]
    async fn failed_merge_is_surfaced_and_retry_clears_it() {
        let h = harness();
        h.store.mutate_favorites(set(&["x"]));
        h.backend.fail_reads(Some(RemoteError::Transient("down".into())));

        h.machine.handle(Identity::signed_in("alice")).await;
        assert_eq!(h.machine.state().phase, IdentityPhase::SignedIn);
        assert!(!h.machine.is_reconciled());
        assert!(h.status.get().error.is_some());
        assert!(!h.status.get().is_online);

        h.backend.fail_reads(None);
        h.machine.retry_sync().await.expect("retry");
        let status = h.status.get();
        assert_eq!(status.error, None);
        assert!(status.is_online);
        assert!(h.backend.favorites_of("alice").await.contains("x"));
    }

    #[tokio::test]
    async fn background_failure_stays_silent() {
        let h = harness();
        h.machine.handle(Identity::signed_in("alice")).await;
        h.backend.fail_reads(Some(RemoteError::Transient("flaky".into())));

        let result = h.machine.sync_favorites(SyncTrigger::Periodic).await;
        assert!(result.is_err());
        assert_eq!(h.status.get().error, None);
        assert!(h.machine.is_reconciled());
    }

    #[tokio::test]
    async fn periodic_sync_adopts_remote_set() {
        let h = harness();
        h.backend.seed_favorites("alice", ["a"]).await;
        h.machine.handle(Identity::signed_in("alice")).await;
        // Removed on another device
        h.backend.remove_favorite("alice", "a").await.expect("remove");

        h.machine.sync_favorites(SyncTrigger::Periodic).await.expect("sync");
        assert!(h.store.favorites().is_empty());
        assert_eq!(h.backend.add_favorite_calls(), 0);
        assert_eq!(h.backend.remove_favorite_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sync_keeps_favorite_write_in_flight() {
        let h = harness();
        h.backend.seed_favorites("alice", ["a"]).await;
        h.machine.handle(Identity::signed_in("alice")).await;
        let controller = Arc::new(FavoriteController::new(
            h.backend.clone(),
            h.store.clone(),
            h.guard.clone(),
            h.machine.subscribe(),
        ));
        h.backend.set_write_latency(Some(Duration::from_secs(2)));

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.toggle("n").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.is_pending("n"));

        h.machine.sync_favorites(SyncTrigger::Periodic).await.expect("sync");
        assert_eq!(h.store.favorites(), set(&["a", "n"]));

        assert!(pending.await.expect("join").expect("toggle"));
        assert_eq!(h.store.favorites(), set(&["a", "n"]));
        assert_eq!(h.backend.favorites_of("alice").await, set(&["a", "n"]));
    }

    #[tokio::test]
    async fn sync_while_anonymous_is_noop() {
        let h = harness();
        h.machine.sync_favorites(SyncTrigger::Manual).await.expect("noop");
        assert_eq!(h.backend.get_favorites_calls(), 0);
    }

    #[tokio::test]
    async fn switching_users_drops_previous_projection() {
        let h = harness();
        h.machine.handle(Identity::signed_in("alice")).await;
        h.user_votes.prime(
            &Scope::User("alice".into()),
            HashMap::from([("a".to_string(), Some(VoteDirection::Down))]),
        );

        h.machine.handle(Identity::signed_in("bob")).await;
        assert!(h.user_votes.is_empty());
        assert_eq!(h.machine.state().identity.user_id(), Some("bob"));
        assert_eq!(h.backend.get_favorites_calls(), 2);
    }

    #[tokio::test]
    async fn token_sink_sees_every_identity() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let h = harness();
        let machine = h.machine.with_token_sink(Arc::new(move |token: Option<&str>| {
            crate::lock(&sink_seen).push(token.map(str::to_string));
        }));

        machine
            .handle(Identity::SignedIn {
                user_id: "alice".into(),
                access_token: Some("t1".into()),
            })
            .await;
        machine.handle(Identity::Anonymous).await;

        assert_eq!(*crate::lock(&seen), vec![Some("t1".to_string()), None]);
    }
}
