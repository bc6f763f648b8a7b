// SPDX-License-Identifier: MPL-2.0

use crate::lock;
use crate::model::{ResourceId, UserId};
use crate::mutation::MutationError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One actor acting on one resource. `None` is the anonymous local actor.
type Target = (Option<UserId>, ResourceId);

#[derive(Default)]
struct GuardState {
    in_flight: HashSet<Target>,
    last_started: HashMap<Target, Instant>,
}

/// Serializes mutations per (actor, resource) and debounces repeated clicks.
///
/// A second attempt on a target is refused while the first is unsettled, and
/// any attempt within `cooldown` of the previous start is refused as well.
/// Refused attempts are dropped, never queued.
pub struct MutationGuard {
    cooldown: Duration,
    state: Mutex<GuardState>,
}

impl MutationGuard {
    pub fn new(cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            cooldown,
            state: Mutex::new(GuardState::default()),
        })
    }

    /// Claim the target. The claim lasts until the returned ticket is dropped.
    pub fn try_begin(
        self: &Arc<Self>,
        actor: Option<&str>,
        resource_id: &str,
    ) -> Result<MutationTicket, MutationError> {
        let target: Target = (actor.map(str::to_string), resource_id.to_string());
        let now = Instant::now();
        let mut state = lock(&self.state);

        if state.in_flight.contains(&target) {
            return Err(MutationError::InFlight);
        }

        let cooldown = self.cooldown;
        state
            .last_started
            .retain(|_, started| now.duration_since(*started) < cooldown);
        if let Some(started) = state.last_started.get(&target) {
            return Err(MutationError::CoolingDown {
                remaining: cooldown.saturating_sub(now.duration_since(*started)),
            });
        }

        state.in_flight.insert(target.clone());
        if !cooldown.is_zero() {
            state.last_started.insert(target.clone(), now);
        }
        Ok(MutationTicket {
            guard: Arc::clone(self),
            target,
        })
    }

    pub fn is_pending(&self, actor: Option<&str>, resource_id: &str) -> bool {
        let target: Target = (actor.map(str::to_string), resource_id.to_string());
        lock(&self.state).in_flight.contains(&target)
    }

    /// Resources `actor` has unsettled mutations on.
    pub fn pending_for(&self, actor: Option<&str>) -> Vec<ResourceId> {
        lock(&self.state)
            .in_flight
            .iter()
            .filter(|(owner, _)| owner.as_deref() == actor)
            .map(|(_, resource_id)| resource_id.clone())
            .collect()
    }
}

/// Proof that a mutation owns its target. Releases it on drop.
pub struct MutationTicket {
    guard: Arc<MutationGuard>,
    target: Target,
}

impl Drop for MutationTicket {
    fn drop(&mut self) {
        lock(&self.guard.state).in_flight.remove(&self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_attempt_while_in_flight_is_refused() {
        let guard = MutationGuard::new(Duration::ZERO);
        let ticket = guard.try_begin(Some("alice"), "r1").expect("first");
        assert!(guard.is_pending(Some("alice"), "r1"));
        assert!(matches!(
            guard.try_begin(Some("alice"), "r1"),
            Err(MutationError::InFlight)
        ));

        drop(ticket);
        assert!(!guard.is_pending(Some("alice"), "r1"));
        assert!(guard.try_begin(Some("alice"), "r1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_outlives_settlement() {
        let guard = MutationGuard::new(Duration::from_millis(500));
        drop(guard.try_begin(Some("alice"), "r1").expect("first"));

        tokio::time::advance(Duration::from_millis(200)).await;
        match guard.try_begin(Some("alice"), "r1") {
            Err(MutationError::CoolingDown { remaining }) => {
                assert_eq!(remaining, Duration::from_millis(300));
            }
            _ => panic!("expected cooldown"),
        }

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(guard.try_begin(Some("alice"), "r1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn targets_are_independent() {
        let guard = MutationGuard::new(Duration::from_millis(500));
        let _a = guard.try_begin(Some("alice"), "r1").expect("alice r1");
        let b = guard.try_begin(Some("alice"), "r2").expect("alice r2");
        let _c = guard.try_begin(Some("bob"), "r1").expect("bob r1");
        let _d = guard.try_begin(None, "r1").expect("anonymous r1");

        let mut pending = guard.pending_for(Some("alice"));
        pending.sort();
        assert_eq!(pending, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(guard.pending_for(None), vec!["r1".to_string()]);

        drop(b);
        assert_eq!(guard.pending_for(Some("alice")), vec!["r1".to_string()]);
    }
}
