// SPDX-License-Identifier: MPL-2.0

use crate::model::{Identity, ResourceId, UserId};
use std::fmt;
use std::sync::Arc;

/// What a batch cache stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Aggregate score counters, identical for every viewer
    Scores,
    /// The signed-in user's own vote per resource
    UserVotes,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Scores => "scores",
            ResourceKind::UserVotes => "user-votes",
        }
    }
}

/// Whose view of the data an entry holds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Shared,
    User(UserId),
}

impl Scope {
    /// Scope a kind resolves to for `identity`. `None` when the kind needs a user and there is none.
    pub fn for_kind(kind: ResourceKind, identity: &Identity) -> Option<Scope> {
        match kind {
            ResourceKind::Scores => Some(Scope::Shared),
            ResourceKind::UserVotes => identity.user_id().map(|id| Scope::User(id.to_string())),
        }
    }
}

/// Canonical key of one cache entry.
///
/// IDs are sorted and de-duplicated, so the order callers list them in never
/// produces a different key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: ResourceKind,
    scope: Scope,
    ids: Arc<[ResourceId]>,
}

impl CacheKey {
    pub fn new<I, S>(kind: ResourceKind, scope: Scope, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceId>,
    {
        Self {
            kind,
            scope,
            ids: canonical_ids(ids).into(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn ids(&self) -> &[ResourceId] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .binary_search_by(|probe| probe.as_str().cmp(id))
            .is_ok()
    }

    /// Whether every ID of `other` is also in `self`.
    pub fn covers(&self, ids: &[ResourceId]) -> bool {
        ids.iter().all(|id| self.contains(id))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match &self.scope {
            Scope::Shared => "*",
            Scope::User(id) => id.as_str(),
        };
        write!(f, "{}/{}/[{}]", self.kind.as_str(), scope, self.ids.join(","))
    }
}

/// Sorted, de-duplicated copy of `ids`.
pub fn canonical_ids<I, S>(ids: I) -> Vec<ResourceId>
where
    I: IntoIterator<Item = S>,
    S: Into<ResourceId>,
{
    let mut ids: Vec<ResourceId> = ids.into_iter().map(Into::into).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_and_duplicates_do_not_change_key() {
        let a = CacheKey::new(ResourceKind::Scores, Scope::Shared, ["c", "a", "b", "a"]);
        let b = CacheKey::new(ResourceKind::Scores, Scope::Shared, ["b", "c", "a"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "scores/*/[a,b,c]");
    }

    #[test]
    fn scope_and_kind_are_part_of_key() {
        let alice = CacheKey::new(ResourceKind::UserVotes, Scope::User("alice".into()), ["a"]);
        let bob = CacheKey::new(ResourceKind::UserVotes, Scope::User("bob".into()), ["a"]);
        let shared = CacheKey::new(ResourceKind::Scores, Scope::Shared, ["a"]);
        assert_ne!(alice, bob);
        assert_ne!(alice, shared);
    }

    #[test]
    fn covers_checks_membership() {
        let key = CacheKey::new(ResourceKind::Scores, Scope::Shared, ["a", "b", "c"]);
        assert!(key.covers(&["c".into(), "a".into()]));
        assert!(!key.covers(&["a".into(), "z".into()]));
    }

    #[test]
    fn user_votes_need_identity() {
        assert_eq!(
            Scope::for_kind(ResourceKind::UserVotes, &Identity::Anonymous),
            None
        );
        assert_eq!(
            Scope::for_kind(ResourceKind::Scores, &Identity::Anonymous),
            Some(Scope::Shared)
        );
        assert_eq!(
            Scope::for_kind(ResourceKind::UserVotes, &Identity::signed_in("u1")),
            Some(Scope::User("u1".into()))
        );
    }
}
