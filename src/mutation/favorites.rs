// SPDX-License-Identifier: MPL-2.0

use crate::model::ResourceId;
use crate::mutation::{Mutation, MutationError, MutationGuard, Transaction, stable_actor};
use crate::remote::{FavoritesService, RemoteError};
use crate::store::LocalStore;
use crate::sync::IdentityState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Toggles favorites in the local store and, when signed in, remotely.
pub struct FavoriteController {
    service: Arc<dyn FavoritesService>,
    store: Arc<LocalStore>,
    guard: Arc<MutationGuard>,
    identity: watch::Receiver<IdentityState>,
}

impl FavoriteController {
    pub fn new(
        service: Arc<dyn FavoritesService>,
        store: Arc<LocalStore>,
        guard: Arc<MutationGuard>,
        identity: watch::Receiver<IdentityState>,
    ) -> Self {
        Self {
            service,
            store,
            guard,
            identity,
        }
    }

    pub fn is_favorite(&self, resource_id: &str) -> bool {
        self.store.is_favorite(resource_id)
    }

    pub fn is_pending(&self, resource_id: &str) -> bool {
        let identity = self.identity.borrow();
        self.guard.is_pending(identity.identity.user_id(), resource_id)
    }

    /// Flip membership of `resource_id`, returning whether it is a favorite afterwards.
    ///
    /// Anonymous toggles only touch the local store, which owns the set until
    /// an identity is bound.
    pub async fn toggle(&self, resource_id: &str) -> Result<bool, MutationError> {
        let user_id = self.identity.borrow().identity.user_id().map(str::to_string);
        let _ticket = self.guard.try_begin(user_id.as_deref(), resource_id)?;

        let previous = self.store.is_favorite(resource_id);
        let next = !previous;

        let Some(user_id) = user_id else {
            self.store.set_favorite(resource_id, next);
            debug!(resource_id, favorite = next, "local favorite toggled");
            return Ok(next);
        };

        let tx = FavoriteTransaction {
            store: Arc::clone(&self.store),
            resource_id: resource_id.to_string(),
            previous,
            next,
        };
        let dispatch = async {
            stable_actor(&self.identity, &user_id).await?;
            if next {
                self.service.add_favorite(&user_id, resource_id).await
            } else {
                self.service.remove_favorite(&user_id, resource_id).await
            }
        };
        Mutation::new("favorite", tx).run(dispatch).await
    }

    /// Remove every favorite, remotely too when signed in.
    pub async fn clear(&self) -> Result<(), MutationError> {
        let user_id = self.identity.borrow().identity.user_id().map(str::to_string);
        if let Some(user_id) = user_id {
            stable_actor(&self.identity, &user_id).await?;
            if let Err(e) = self.service.clear_favorites(&user_id).await {
                warn!(error = %e, "failed to clear remote favorites");
                self.store.set_error(Some(e.to_string()));
                return Err(e.into());
            }
        }
        self.store.clear_favorites();
        Ok(())
    }
}

struct FavoriteTransaction {
    store: Arc<LocalStore>,
    resource_id: ResourceId,
    previous: bool,
    next: bool,
}

impl Transaction for FavoriteTransaction {
    type Output = bool;

    fn apply(&mut self) {
        self.store.set_favorite(&self.resource_id, self.next);
    }

    fn commit(&mut self, present: &bool) {
        self.store.set_favorite(&self.resource_id, *present);
        self.store.set_error(None);
    }

    fn rollback(&mut self, error: &RemoteError) {
        self.store.set_favorite(&self.resource_id, self.previous);
        self.store.set_error(Some(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use crate::remote::memory::MemoryBackend;
    use crate::sync::IdentityPhase;
    use std::time::Duration;

    const COOLDOWN: Duration = Duration::from_millis(500);

    fn controller(
        backend: Arc<MemoryBackend>,
        identity: Identity,
    ) -> (FavoriteController, Arc<LocalStore>, watch::Sender<IdentityState>) {
        let store = Arc::new(LocalStore::in_memory());
        let phase = if identity.is_signed_in() {
            IdentityPhase::SignedIn
        } else {
            IdentityPhase::Anonymous
        };
        let (tx, rx) = watch::channel(IdentityState { phase, identity });
        let controller = FavoriteController::new(backend, store.clone(), MutationGuard::new(COOLDOWN), rx);
        (controller, store, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_toggle_stays_local() {
        let backend = Arc::new(MemoryBackend::new());
        let (favorites, store, _identity) = controller(backend.clone(), Identity::Anonymous);

        assert!(favorites.toggle("x").await.expect("toggle"));
        assert!(store.is_favorite("x"));
        assert_eq!(backend.add_favorite_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signed_in_toggle_writes_through() {
        let backend = Arc::new(MemoryBackend::new());
        let (favorites, store, _identity) = controller(backend.clone(), Identity::signed_in("alice"));

        assert!(favorites.toggle("x").await.expect("add"));
        assert!(backend.favorites_of("alice").await.contains("x"));

        tokio::time::advance(COOLDOWN).await;
        assert!(!favorites.toggle("x").await.expect("remove"));
        assert!(!store.is_favorite("x"));
        assert!(backend.favorites_of("alice").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_toggle_rolls_back_and_reports() {
        let backend = Arc::new(MemoryBackend::new());
        let (favorites, store, _identity) = controller(backend.clone(), Identity::signed_in("alice"));
        store.set_favorite("y", true);
        let before = store.favorites();
        backend.fail_next_write(RemoteError::Transient("offline".into()));

        let err = favorites.toggle("x").await.expect_err("fails");
        assert!(matches!(err, MutationError::Failed(_)));
        assert_eq!(store.favorites(), before);
        assert!(store.error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_favorite_is_visible_while_in_flight() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_latency(Some(Duration::from_millis(200)));
        let (favorites, store, _identity) = controller(backend.clone(), Identity::signed_in("alice"));
        let favorites = Arc::new(favorites);

        let pending = {
            let favorites = favorites.clone();
            tokio::spawn(async move { favorites.toggle("x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_favorite("x"));
        assert!(favorites.is_pending("x"));
        assert!(matches!(favorites.toggle("x").await, Err(MutationError::InFlight)));

        assert!(pending.await.expect("join").expect("toggle"));
        assert!(!favorites.is_pending("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_local_and_remote() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_favorites("alice", ["a", "b"]).await;
        let (favorites, store, _identity) = controller(backend.clone(), Identity::signed_in("alice"));
        store.set_favorite("a", true);

        favorites.clear().await.expect("clear");
        assert!(store.favorites().is_empty());
        assert!(backend.favorites_of("alice").await.is_empty());
    }
}
