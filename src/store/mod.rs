// SPDX-License-Identifier: MPL-2.0

//! Persisted local state.
//!
//! The local store is the only state available before an identity is known.
//! It keeps the favorite set, UI preferences and sync metadata in memory and
//! writes a JSON blob through a [`Persistence`] backend after every change.
//! Loading never fails: a missing or unreadable blob yields defaults.

mod file;
mod memory;
mod preferences;
mod schema;
mod sqlite;

pub use file::JsonFilePersistence;
pub use memory::MemoryPersistence;
pub use preferences::{Layout, Preferences};
pub use sqlite::SqlitePersistence;

use crate::lock;
use crate::model::FavoriteSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage path error: {0}")]
    Path(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Somewhere to keep the serialized local state between runs.
pub trait Persistence: Send + Sync {
    /// Returns `Ok(None)` when nothing has been stored yet.
    fn read(&self) -> Result<Option<String>, PersistenceError>;
    fn write(&self, blob: &str) -> Result<(), PersistenceError>;
    fn clear(&self) -> Result<(), PersistenceError>;
}

/// The subset of local state that survives a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub favorite_ids: FavoriteSet,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl PersistedState {
    /// Parse a stored blob, falling back to defaults on any error.
    pub fn from_blob(blob: &str) -> Self {
        match serde_json::from_str(blob) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "discarding unreadable local state");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Default)]
struct LocalState {
    persisted: PersistedState,
    // Transient, reset on every load
    loading: bool,
    error: Option<String>,
    revision: u64,
}

/// In-memory local state with write-through persistence.
pub struct LocalStore {
    state: Mutex<LocalState>,
    backend: Arc<dyn Persistence>,
    /// Highest revision handed to the backend, so late writers never clobber newer blobs
    written: Mutex<u64>,
    changes: watch::Sender<u64>,
}

impl LocalStore {
    /// Restore state from `backend`. Never fails.
    pub fn load(backend: Arc<dyn Persistence>) -> Self {
        let persisted = match backend.read() {
            Ok(Some(blob)) => PersistedState::from_blob(&blob),
            Ok(None) => PersistedState::default(),
            Err(e) => {
                warn!(error = %e, "failed to read local state, starting empty");
                PersistedState::default()
            }
        };
        debug!(favorites = persisted.favorite_ids.len(), "local state loaded");

        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(LocalState {
                persisted,
                ..LocalState::default()
            }),
            backend,
            written: Mutex::new(0),
            changes,
        }
    }

    /// A store that keeps nothing beyond the process lifetime.
    pub fn in_memory() -> Self {
        Self::load(Arc::new(MemoryPersistence::new()))
    }

    pub fn favorites(&self) -> FavoriteSet {
        lock(&self.state).persisted.favorite_ids.clone()
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        lock(&self.state).persisted.favorite_ids.contains(id)
    }

    /// Replace the favorite set wholesale.
    pub fn mutate_favorites(&self, next: FavoriteSet) {
        self.update(|state| {
            if state.favorite_ids == next {
                return false;
            }
            state.favorite_ids = next;
            true
        });
    }

    /// Set membership of a single ID. Returns true if anything changed.
    pub fn set_favorite(&self, id: &str, present: bool) -> bool {
        self.update(|state| {
            if state.favorite_ids.contains(id) == present {
                return false;
            }
            state.favorite_ids.set(id, present);
            true
        })
    }

    pub fn clear_favorites(&self) {
        self.mutate_favorites(FavoriteSet::new());
    }

    pub fn preferences(&self) -> Preferences {
        lock(&self.state).persisted.preferences.clone()
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        self.update(|state| {
            if state.preferences == preferences {
                return false;
            }
            state.preferences = preferences;
            true
        });
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).persisted.last_synced_at
    }

    pub fn set_last_synced_at(&self, at: Option<DateTime<Utc>>) {
        self.update(|state| {
            if state.last_synced_at == at {
                return false;
            }
            state.last_synced_at = at;
            true
        });
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    pub fn set_loading(&self, loading: bool) {
        lock(&self.state).loading = loading;
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        lock(&self.state).error = error;
    }

    pub fn snapshot(&self) -> PersistedState {
        lock(&self.state).persisted.clone()
    }

    /// Revision counter bumped on every persisted change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut PersistedState) -> bool) -> bool {
        let (revision, blob) = {
            let mut state = lock(&self.state);
            if !f(&mut state.persisted) {
                return false;
            }
            state.revision += 1;
            (state.revision, serde_json::to_string(&state.persisted))
        };
        self.changes.send_replace(revision);
        self.persist(revision, blob);
        true
    }

    // Failures are logged only: the in-memory state stays authoritative.
    fn persist(&self, revision: u64, blob: Result<String, serde_json::Error>) {
        let blob = match blob {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "failed to serialize local state");
                return;
            }
        };
        let mut written = lock(&self.written);
        if *written > revision {
            return;
        }
        match self.backend.write(&blob) {
            Ok(()) => *written = revision,
            Err(e) => warn!(error = %e, revision, "failed to persist local state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_moves_only_on_persisted_change() {
        let store = LocalStore::in_memory();
        let changes = store.subscribe();
        assert_eq!(*changes.borrow(), 0);

        store.set_favorite("x", true);
        assert_eq!(*changes.borrow(), 1);
        store.set_favorite("x", true);
        store.set_loading(true);
        store.set_error(Some("transient".into()));
        assert_eq!(*changes.borrow(), 1);

        store.clear_favorites();
        assert_eq!(*changes.borrow(), 2);
    }

    #[test]
    fn corrupt_blob_yields_defaults() {
        let backend = Arc::new(MemoryPersistence::with_blob("{not json"));
        let store = LocalStore::load(backend);
        assert!(store.favorites().is_empty());
        assert_eq!(store.preferences(), Preferences::default());
        assert_eq!(store.last_synced_at(), None);
    }

    #[test]
    fn round_trips_persisted_subset() {
        let backend = Arc::new(MemoryPersistence::new());
        let store = LocalStore::load(backend.clone());
        store.set_favorite("x", true);
        store.set_favorite("y", true);
        store.set_preferences(Preferences {
            layout: Layout::List,
            ..Preferences::default()
        });
        let synced = Utc::now();
        store.set_last_synced_at(Some(synced));
        store.set_loading(true);
        store.set_error(Some("boom".into()));

        let reloaded = LocalStore::load(backend);
        assert_eq!(reloaded.snapshot(), store.snapshot());
        assert_eq!(reloaded.last_synced_at(), Some(synced));
        assert!(!reloaded.is_loading());
        assert_eq!(reloaded.error(), None);
    }

    #[test]
    fn write_failure_keeps_memory_state() {
        let backend = Arc::new(MemoryPersistence::new());
        backend.fail_writes(true);
        let store = LocalStore::load(backend.clone());

        store.set_favorite("x", true);
        assert!(store.is_favorite("x"));
        assert_eq!(backend.blob(), None);

        backend.fail_writes(false);
        store.set_favorite("y", true);
        let reloaded = LocalStore::load(backend);
        assert!(reloaded.is_favorite("x"));
        assert!(reloaded.is_favorite("y"));
    }

    #[test]
    fn unchanged_writes_are_skipped() {
        let backend = Arc::new(MemoryPersistence::new());
        let store = LocalStore::load(backend.clone());
        store.set_favorite("x", true);
        store.set_favorite("x", true);
        store.mutate_favorites(store.favorites());
        assert_eq!(backend.write_count(), 1);
    }

    #[test]
    fn missing_fields_default() {
        let state = PersistedState::from_blob(r#"{"favoriteIds":["a"]}"#);
        assert!(state.favorite_ids.contains("a"));
        assert_eq!(state.preferences, Preferences::default());
    }
}
