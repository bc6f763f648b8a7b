// SPDX-License-Identifier: MPL-2.0

mod favorites;
mod identity;
mod status;
mod votes;

pub use favorites::FavoriteSet;
pub use identity::Identity;
pub use status::SyncStatus;
pub use votes::{ResourceScore, VoteDirection, VoteRecord, VoteResult};

/// Opaque identifier of a listed resource.
pub type ResourceId = String;

/// Identifier of a signed-in user as issued by the identity provider.
pub type UserId = String;
