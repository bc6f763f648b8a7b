// SPDX-License-Identifier: MPL-2.0

mod background;
mod identity;
mod provider;
mod status;

pub use background::{NetworkMonitor, NetworkState, spawn_background_sync, spawn_identity_listener};
pub use identity::{IdentityMachine, IdentityPhase, IdentityState, SyncTrigger, TokenSink};
pub use provider::{IdentityProvider, SessionIdentity};
pub use status::SyncStatusHandle;
