// SPDX-License-Identifier: MPL-2.0

//! Optimistic sync engine for favorites and votes on a listing directory.
//!
//! Local state works before anyone signs in; once an identity is bound the
//! remote store becomes the authority and local state a write-through cache
//! of it. Votes and scores go through a shared batch cache so any number of
//! widgets on a screen cost one round trip.

pub mod cache;
pub mod config;
pub mod engine;
pub mod logging;
pub mod model;
pub mod mutation;
pub mod remote;
pub mod runtime;
pub mod scope;
pub mod store;
pub mod sync;

pub use config::EngineConfig;
pub use engine::{Remote, SyncEngine};
pub use model::{FavoriteSet, Identity, ResourceId, ResourceScore, SyncStatus, UserId, VoteDirection};
pub use mutation::MutationError;
pub use remote::RemoteError;
pub use scope::{BatchScope, FavoriteStatus, VoteStatus};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
