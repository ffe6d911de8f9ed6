//! # Queue Entry
//!
//! One row per waiting user. Admission, fairness scoring, and preference
//! expansion all operate on this type.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct QueueEntry {
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    pub fairness: i32,
    /// How much of `fairness` the wait-time boost ladder has already
    /// contributed, kept separate from the respin yes-boost mixed into
    /// the same total.
    pub wait_boost_applied: i32,
    /// Preference relaxation level, 0-3. Higher stages relax
    /// age/distance/gender constraints.
    pub preference_stage: i16,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_expanded_at: Option<OffsetDateTime>,
}

impl QueueEntry {
    /// How long this entry has been continuously waiting, as of `now`.
    pub fn waited_for(&self, now: OffsetDateTime) -> std::time::Duration {
        (now - self.joined_at)
            .try_into()
            .unwrap_or(std::time::Duration::ZERO)
    }
}
