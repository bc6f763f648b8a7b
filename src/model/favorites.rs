// SPDX-License-Identifier: MPL-2.0

use crate::model::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of favorited resource IDs owned by one identity context.
///
/// Backed by an ordered set so two sets with the same members compare and
/// serialize identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FavoriteSet(BTreeSet<ResourceId>);

impl FavoriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    /// Returns true if the ID was not already present.
    pub fn insert(&mut self, id: impl Into<ResourceId>) -> bool {
        self.0.insert(id.into())
    }

    /// Returns true if the ID was present.
    pub fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    /// Set membership of `id` explicitly.
    pub fn set(&mut self, id: &str, present: bool) {
        if present {
            self.0.insert(id.to_string());
        } else {
            self.0.remove(id);
        }
    }

    /// Flip membership of `id`, returning the new membership.
    pub fn toggle(&mut self, id: &str) -> bool {
        if self.0.remove(id) {
            false
        } else {
            self.0.insert(id.to_string());
            true
        }
    }

    /// Union of both sets. Never drops a member of either side.
    pub fn union(&self, other: &FavoriteSet) -> FavoriteSet {
        FavoriteSet(self.0.union(&other.0).cloned().collect())
    }

    /// Members of `self` that `other` does not contain.
    pub fn difference<'a>(&'a self, other: &'a FavoriteSet) -> impl Iterator<Item = &'a ResourceId> {
        self.0.difference(&other.0)
    }

    /// Replay local edits made since `base` on top of a freshly merged set.
    ///
    /// `current` is the local set now, `base` the local set the merge was
    /// computed from. Additions and removals made in between win over `merged`.
    pub fn rebase(merged: &FavoriteSet, base: &FavoriteSet, current: &FavoriteSet) -> FavoriteSet {
        let mut out = merged.clone();
        for added in current.difference(base) {
            out.0.insert(added.clone());
        }
        for removed in base.difference(current) {
            out.0.remove(removed);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<ResourceId>> FromIterator<S> for FavoriteSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        FavoriteSet(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> FavoriteSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn union_contains_both_sides_and_is_idempotent() {
        let cases = [
            (set(&[]), set(&[])),
            (set(&["x", "y"]), set(&["y", "z"])),
            (set(&["a"]), set(&[])),
            (set(&[]), set(&["b", "c"])),
        ];
        for (local, remote) in cases {
            let merged = local.union(&remote);
            assert!(local.iter().all(|id| merged.contains(id)));
            assert!(remote.iter().all(|id| merged.contains(id)));
            assert_eq!(merged.union(&remote), merged);
        }
    }

    #[test]
    fn toggle_twice_restores_membership() {
        let mut favorites = set(&["x"]);
        let before = favorites.clone();
        assert!(!favorites.toggle("x"));
        assert!(favorites.toggle("x"));
        assert_eq!(favorites, before);

        assert!(favorites.toggle("new"));
        assert!(!favorites.toggle("new"));
        assert_eq!(favorites, before);
    }

    #[test]
    fn rebase_keeps_edits_made_during_merge() {
        let base = set(&["x", "y"]);
        let current = set(&["y", "w"]);
        let merged = set(&["x", "y", "z"]);

        let rebased = FavoriteSet::rebase(&merged, &base, &current);
        assert_eq!(rebased, set(&["w", "y", "z"]));
    }

    #[test]
    fn serializes_as_sorted_array() {
        let favorites = set(&["b", "a", "c"]);
        let json = serde_json::to_string(&favorites).expect("serialize");
        assert_eq!(json, r#"["a","b","c"]"#);
    }
}
