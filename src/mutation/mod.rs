// SPDX-License-Identifier: MPL-2.0

//! Optimistic mutations.
//!
//! A user action is applied to local state first, then sent to the remote
//! service. Every mutation walks one path through
//! `Idle -> OptimisticApplied -> SettledSuccess | SettledFailure`.
//! On success the server's answer replaces the optimistic guess; on failure
//! everything the action touched goes back to its pre-action snapshot.

mod favorites;
mod guard;
mod votes;

pub use favorites::FavoriteController;
pub use guard::{MutationGuard, MutationTicket};
pub use votes::VoteController;

use crate::remote::{RemoteError, RemoteResult};
use crate::sync::{IdentityPhase, IdentityState};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("sign in required")]
    SignInRequired,
    #[error("a change to this item is already in progress")]
    InFlight,
    #[error("too many clicks, wait {}ms", remaining.as_millis())]
    CoolingDown { remaining: Duration },
    #[error("rate limited, try again in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("{0}")]
    Failed(RemoteError),
}

impl MutationError {
    /// Rejected locally without any state change or remote call.
    pub fn is_ignored(&self) -> bool {
        matches!(self, MutationError::InFlight | MutationError::CoolingDown { .. })
    }
}

impl From<RemoteError> for MutationError {
    fn from(e: RemoteError) -> Self {
        if let Some(retry_after) = e.cooldown() {
            return MutationError::RateLimited { retry_after };
        }
        match e {
            RemoteError::NotAuthenticated => MutationError::SignInRequired,
            other => MutationError::Failed(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    OptimisticApplied,
    SettledSuccess,
    SettledFailure,
}

/// A local change that can be shown before the server confirms it.
pub trait Transaction {
    /// What the server answers with
    type Output;

    /// Make the optimistic change visible and remember what it replaced.
    fn apply(&mut self);

    /// Replace the optimistic guess with the server's answer.
    fn commit(&mut self, output: &Self::Output);

    /// Put back exactly what `apply` replaced.
    fn rollback(&mut self, error: &RemoteError);
}

/// Drives one [`Transaction`] through its phases.
pub struct Mutation<T> {
    tx: T,
    phase: MutationPhase,
    label: &'static str,
}

impl<T: Transaction> Mutation<T> {
    pub fn new(label: &'static str, tx: T) -> Self {
        Self {
            tx,
            phase: MutationPhase::Idle,
            label,
        }
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub fn apply(&mut self) {
        if self.phase != MutationPhase::Idle {
            return;
        }
        self.tx.apply();
        self.transition(MutationPhase::OptimisticApplied);
    }

    /// Settle with the outcome of the remote call.
    pub fn settle(&mut self, outcome: RemoteResult<T::Output>) -> RemoteResult<T::Output> {
        if self.phase != MutationPhase::OptimisticApplied {
            return outcome;
        }
        match outcome {
            Ok(output) => {
                self.tx.commit(&output);
                self.transition(MutationPhase::SettledSuccess);
                Ok(output)
            }
            Err(e) => {
                self.tx.rollback(&e);
                debug!(mutation = self.label, error = %e, "rolled back");
                self.transition(MutationPhase::SettledFailure);
                Err(e)
            }
        }
    }

    /// Apply, await `dispatch`, then commit or roll back.
    pub async fn run<F>(mut self, dispatch: F) -> Result<T::Output, MutationError>
    where
        F: Future<Output = RemoteResult<T::Output>>,
    {
        self.apply();
        let outcome = dispatch.await;
        self.settle(outcome).map_err(MutationError::from)
    }

    fn transition(&mut self, next: MutationPhase) {
        debug!(mutation = self.label, from = ?self.phase, to = ?next, "mutation phase");
        self.phase = next;
    }
}

/// Wait out any identity transition, then confirm `user_id` is still the actor.
pub(crate) async fn stable_actor(
    identity: &watch::Receiver<IdentityState>,
    user_id: &str,
) -> RemoteResult<()> {
    let mut identity = identity.clone();
    let state = identity
        .wait_for(|state| state.phase != IdentityPhase::Transitioning)
        .await
        .map_err(|_| RemoteError::Transient("identity source closed".into()))?;
    if state.identity.user_id() == Some(user_id) {
        Ok(())
    } else {
        Err(RemoteError::NotAuthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        value: i32,
        saved: Option<i32>,
    }

    impl Transaction for &mut Counter {
        type Output = i32;

        fn apply(&mut self) {
            self.saved = Some(self.value);
            self.value += 1;
        }

        fn commit(&mut self, output: &i32) {
            self.value = *output;
        }

        fn rollback(&mut self, _error: &RemoteError) {
            if let Some(saved) = self.saved.take() {
                self.value = saved;
            }
        }
    }

    #[test]
    fn success_walks_to_settled_success() {
        let mut counter = Counter { value: 4, saved: None };
        let mut mutation = Mutation::new("test", &mut counter);
        assert_eq!(mutation.phase(), MutationPhase::Idle);
        mutation.apply();
        assert_eq!(mutation.phase(), MutationPhase::OptimisticApplied);
        assert_eq!(mutation.settle(Ok(7)), Ok(7));
        assert_eq!(mutation.phase(), MutationPhase::SettledSuccess);
        assert_eq!(counter.value, 7);
    }

    #[test]
    fn failure_restores_snapshot() {
        let mut counter = Counter { value: 4, saved: None };
        let mut mutation = Mutation::new("test", &mut counter);
        mutation.apply();
        let outcome = mutation.settle(Err(RemoteError::Transient("boom".into())));
        assert!(outcome.is_err());
        assert_eq!(mutation.phase(), MutationPhase::SettledFailure);
        assert_eq!(counter.value, 4);
    }

    #[test]
    fn settled_mutation_ignores_further_outcomes() {
        let mut counter = Counter::default();
        let mut mutation = Mutation::new("test", &mut counter);
        mutation.apply();
        let _ = mutation.settle(Ok(1));
        let _ = mutation.settle(Err(RemoteError::Transient("late".into())));
        assert_eq!(mutation.phase(), MutationPhase::SettledSuccess);
        assert_eq!(counter.value, 1);
    }

    #[test]
    fn remote_errors_map_to_user_outcomes() {
        assert_eq!(
            MutationError::from(RemoteError::NotAuthenticated),
            MutationError::SignInRequired
        );
        assert_eq!(
            MutationError::from(RemoteError::RateLimited { cooldown_seconds: 42 }),
            MutationError::RateLimited {
                retry_after: Duration::from_secs(42)
            }
        );
        assert!(matches!(
            MutationError::from(RemoteError::Conflict("dup".into())),
            MutationError::Failed(RemoteError::Conflict(_))
        ));
    }

    #[test]
    fn only_local_refusals_are_ignored() {
        assert!(MutationError::InFlight.is_ignored());
        assert!(
            MutationError::CoolingDown {
                remaining: Duration::from_millis(10)
            }
            .is_ignored()
        );
        assert!(!MutationError::SignInRequired.is_ignored());
        assert!(!MutationError::from(RemoteError::RateLimited { cooldown_seconds: 5 }).is_ignored());
    }
}
