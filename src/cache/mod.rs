// SPDX-License-Identifier: MPL-2.0

mod batch;
mod key;
mod sources;

pub use batch::{BatchCache, BatchFetcher, CacheSnapshot, Lookup};
pub use key::{CacheKey, ResourceKind, Scope, canonical_ids};
pub use sources::{ScoreSource, UserVoteSource};

use crate::model::{ResourceScore, VoteDirection};

/// Aggregate scores, shared by every viewer.
pub type ScoreCache = BatchCache<ResourceScore>;

/// The signed-in user's own vote per resource. `None` means no vote.
pub type UserVoteCache = BatchCache<Option<VoteDirection>>;
