// SPDX-License-Identifier: MPL-2.0

use crate::model::SyncStatus;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Shared, observable [`SyncStatus`].
#[derive(Clone)]
pub struct SyncStatusHandle {
    tx: watch::Sender<SyncStatus>,
}

impl Default for SyncStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    pub fn get(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn set_signed_in(&self, signed_in: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.is_signed_in != signed_in;
            status.is_signed_in = signed_in;
            changed
        });
    }

    /// A reconciliation succeeded. The error, if any, is left for an explicit retry to clear.
    pub fn mark_synced(&self, at: DateTime<Utc>) {
        self.tx.send_modify(|status| {
            status.is_online = true;
            status.last_synced_at = Some(at);
        });
    }

    pub fn mark_offline(&self) {
        self.tx.send_if_modified(|status| {
            let changed = status.is_online;
            status.is_online = false;
            changed
        });
    }

    pub fn set_error(&self, error: Option<String>) {
        self.tx.send_if_modified(|status| {
            let changed = status.error != error;
            status.error = error;
            changed
        });
    }

    /// Back to the local-only state after sign-out.
    pub fn reset(&self) {
        self.tx.send_replace(SyncStatus::default());
    }
}
