// SPDX-License-Identifier: MPL-2.0

use crate::model::{Identity, UserId};
use tokio::sync::watch;
use tracing::info;

/// Source of the current identity and its changes.
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Identity;
    fn subscribe(&self) -> watch::Receiver<Identity>;
}

/// In-process session that the host application signs in and out of.
pub struct SessionIdentity {
    tx: watch::Sender<Identity>,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdentity {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Identity::Anonymous);
        Self { tx }
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>, access_token: Option<String>) {
        let user_id = user_id.into();
        info!(user_id = %user_id, "signed in");
        self.tx.send_replace(Identity::SignedIn {
            user_id,
            access_token,
        });
    }

    pub fn sign_out(&self) {
        if self.tx.borrow().is_signed_in() {
            info!("signed out");
        }
        self.tx.send_replace(Identity::Anonymous);
    }
}

impl IdentityProvider for SessionIdentity {
    fn current(&self) -> Identity {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Identity> {
        self.tx.subscribe()
    }
}
