//! # Match & Vote
//!
//! A `Match` is created atomically by the Pair Creator and never deleted
//! once completed: it is the system's pairing history as well as the
//! vote window's backing row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

pub type MatchId = Uuid;

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[sqlx(type_name = "match_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Paired,
    VoteActive,
    Completed,
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[sqlx(type_name = "match_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    BothYes,
    YesPass,
    PassPass,
    YesIdle,
    PassIdle,
    IdleIdle,
}

impl Outcome {
    /// Only `both_yes` seeds the permanent [`crate::models::NeverPair`]
    /// exclusion; every other outcome still records pairing history.
    pub fn is_mutual_yes(&self) -> bool {
        matches!(self, Outcome::BothYes)
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Match {
    pub id: MatchId,
    /// Canonical ordering invariant: `user1_id < user2_id` (P3).
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub status: MatchStatus,
    pub outcome: Option<Outcome>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub vote_window_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub vote_window_expires_at: Option<OffsetDateTime>,
}

impl Match {
    /// Canonicalizes an unordered pair per the system-wide ordering rule.
    pub fn canonical_order(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a < b { (a, b) } else { (b, a) }
    }

    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.user1_id {
            Some(self.user2_id)
        } else if user_id == self.user2_id {
            Some(self.user1_id)
        } else {
            None
        }
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        user_id == self.user1_id || user_id == self.user2_id
    }

    /// P4: `status = vote_active` iff `vote_window_expires_at` is set.
    pub fn invariant_vote_window_consistent(&self) -> bool {
        (self.status == MatchStatus::VoteActive) == self.vote_window_expires_at.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[sqlx(type_name = "vote_value", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VoteValue {
    Yes,
    Pass,
}

impl std::str::FromStr for VoteValue {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(VoteValue::Yes),
            "pass" => Ok(VoteValue::Pass),
            _ => Err(crate::error::AppError::InvalidValue),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Vote {
    pub match_id: MatchId,
    pub user_id: Uuid,
    pub value: VoteValue,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
