// SPDX-License-Identifier: MPL-2.0

use crate::model::UserId;

/// Who the engine is acting for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    #[default]
    Anonymous,
    SignedIn {
        user_id: UserId,
        /// Bearer token for the remote backend, when it needs one
        access_token: Option<String>,
    },
}

impl Identity {
    pub fn signed_in(user_id: impl Into<UserId>) -> Self {
        Identity::SignedIn {
            user_id: user_id.into(),
            access_token: None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Identity::SignedIn { .. })
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::SignedIn { user_id, .. } => Some(user_id),
            Identity::Anonymous => None,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            Identity::SignedIn { access_token, .. } => access_token.as_deref(),
            Identity::Anonymous => None,
        }
    }
}
