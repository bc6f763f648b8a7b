// SPDX-License-Identifier: MPL-2.0

//! Periodic and reconnect-triggered reconciliation.

use crate::sync::identity::{IdentityMachine, SyncTrigger};
use crate::sync::provider::IdentityProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkState {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Connectivity as reported by the host platform.
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkState>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NetworkState::Unknown);
        Self { tx }
    }

    pub fn set(&self, state: NetworkState) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

/// Re-sync favorites every `interval` and whenever the network comes back.
///
/// Failures wait for the next tick or reconnect; nothing retries in a loop.
pub fn spawn_background_sync(
    machine: Arc<IdentityMachine>,
    mut network: watch::Receiver<NetworkState>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = *network.borrow_and_update();
        let mut network_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if machine.is_signed_in() && last != NetworkState::Offline {
                        let _ = machine.sync_favorites(SyncTrigger::Periodic).await;
                    }
                }
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        debug!("network monitor closed, periodic sync only");
                        network_open = false;
                        continue;
                    }
                    let now = *network.borrow_and_update();
                    match (last, now) {
                        (NetworkState::Offline, NetworkState::Online) => {
                            info!("network back online, syncing");
                            let _ = machine.sync_favorites(SyncTrigger::Reconnect).await;
                        }
                        (_, NetworkState::Offline) => machine.mark_offline(),
                        _ => {}
                    }
                    last = now;
                }
            }
        }
    })
}

/// Feed every identity change from `provider` into `machine`, starting with the current one.
pub fn spawn_identity_listener(
    machine: Arc<IdentityMachine>,
    provider: Arc<dyn IdentityProvider>,
) -> JoinHandle<()> {
    let mut identities = provider.subscribe();
    tokio::spawn(async move {
        let initial = identities.borrow_and_update().clone();
        machine.handle(initial).await;
        while identities.changed().await.is_ok() {
            let identity = identities.borrow_and_update().clone();
            machine.handle(identity).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ResourceKind, UserVoteCache, UserVoteSource};
    use crate::model::Identity;
    use crate::remote::RemoteError;
    use crate::remote::memory::MemoryBackend;
    use crate::store::LocalStore;
    use crate::sync::{IdentityPhase, SessionIdentity, SyncStatusHandle};

    const INTERVAL: Duration = Duration::from_secs(300);

    fn machine(backend: Arc<MemoryBackend>) -> (Arc<IdentityMachine>, SyncStatusHandle) {
        let user_votes = UserVoteCache::new(
            ResourceKind::UserVotes,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Arc::new(UserVoteSource::new(backend.clone())),
        );
        let status = SyncStatusHandle::new();
        let machine = IdentityMachine::new(
            Arc::new(LocalStore::in_memory()),
            backend,
            user_votes,
            status.clone(),
        );
        (Arc::new(machine), status)
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_tick_resyncs() {
        let backend = Arc::new(MemoryBackend::new());
        let (machine, _) = machine(backend.clone());
        machine.handle(Identity::signed_in("alice")).await;
        let network = NetworkMonitor::new();

        let task = spawn_background_sync(machine.clone(), network.subscribe(), INTERVAL);
        tokio::time::sleep(INTERVAL / 2).await;
        assert_eq!(backend.get_favorites_calls(), 1);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(backend.get_favorites_calls(), 2);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_edge_triggers_merge() {
        let backend = Arc::new(MemoryBackend::new());
        let (machine, status) = machine(backend.clone());
        machine.handle(Identity::signed_in("alice")).await;
        let network = NetworkMonitor::new();
        let task = spawn_background_sync(machine.clone(), network.subscribe(), INTERVAL);

        // Unknown -> Online is not an edge
        assert_eq!(network.current(), NetworkState::Unknown);
        network.set(NetworkState::Online);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.get_favorites_calls(), 1);

        network.set(NetworkState::Offline);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(network.current(), NetworkState::Offline);
        assert!(!status.get().is_online);
        assert!(!machine.is_reconciled());

        network.set(NetworkState::Online);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.get_favorites_calls(), 2);
        assert!(status.get().is_online);
        assert!(machine.is_reconciled());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_ticks_do_not_spin() {
        let backend = Arc::new(MemoryBackend::new());
        let (machine, status) = machine(backend.clone());
        machine.handle(Identity::signed_in("alice")).await;
        backend.fail_reads(Some(RemoteError::Transient("down".into())));
        let network = NetworkMonitor::new();
        let task = spawn_background_sync(machine.clone(), network.subscribe(), INTERVAL);

        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;
        assert_eq!(backend.get_favorites_calls(), 4);
        assert_eq!(status.get().error, None);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn listener_follows_provider() {
        let backend = Arc::new(MemoryBackend::new());
        let (machine, _) = machine(backend.clone());
        let session = Arc::new(SessionIdentity::new());
        let task = spawn_identity_listener(machine.clone(), session.clone());

        session.sign_in("alice", None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(machine.state().phase, IdentityPhase::SignedIn);

        session.sign_out();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(machine.state().phase, IdentityPhase::Anonymous);
        task.abort();
    }
}
