// SPDX-License-Identifier: MPL-2.0

use crate::model::{ResourceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteDirection::Up => "up",
            VoteDirection::Down => "down",
        }
    }

    /// Vote a voter ends up with after casting `self` on top of `current`.
    ///
    /// Same direction again clears the vote, the opposite direction switches it.
    pub fn toggle(self, current: Option<VoteDirection>) -> Option<VoteDirection> {
        match current {
            Some(existing) if existing == self => None,
            _ => Some(self),
        }
    }
}

impl std::str::FromStr for VoteDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(VoteDirection::Up),
            "down" => Ok(VoteDirection::Down),
            other => Err(format!("unknown vote direction: {other}")),
        }
    }
}

/// One voter's vote on one resource. At most one exists per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub resource_id: ResourceId,
    pub voter_id: UserId,
    pub direction: VoteDirection,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate vote counters for a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceScore {
    pub upvotes: u32,
    pub downvotes: u32,
    #[serde(default)]
    pub initial_score: i64,
}

impl ResourceScore {
    pub fn new(upvotes: u32, downvotes: u32, initial_score: i64) -> Self {
        Self {
            upvotes,
            downvotes,
            initial_score,
        }
    }

    pub fn vote_score(&self) -> i64 {
        i64::from(self.upvotes) - i64::from(self.downvotes)
    }

    pub fn total_score(&self) -> i64 {
        self.initial_score + self.vote_score()
    }

    /// Counters after a voter moves from `previous` to `next`.
    ///
    /// The old contribution is revoked before the new one is applied.
    /// Counters saturate at zero.
    pub fn with_vote_change(
        mut self,
        previous: Option<VoteDirection>,
        next: Option<VoteDirection>,
    ) -> Self {
        match previous {
            Some(VoteDirection::Up) => self.upvotes = self.upvotes.saturating_sub(1),
            Some(VoteDirection::Down) => self.downvotes = self.downvotes.saturating_sub(1),
            None => {}
        }
        match next {
            Some(VoteDirection::Up) => self.upvotes = self.upvotes.saturating_add(1),
            Some(VoteDirection::Down) => self.downvotes = self.downvotes.saturating_add(1),
            None => {}
        }
        self
    }
}

/// Authoritative state returned by the server after a vote is cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResult {
    pub my_vote: Option<VoteDirection>,
    pub score: ResourceScore,
}
