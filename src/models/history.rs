//! # Pairing History & Never-Pair
//!
//! `PairHistory` suppresses re-matching within a cooldown window;
//! `NeverPair` is a permanent hard exclusion seeded only by a mutual-yes
//! completion.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct PairHistory {
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub last_matched_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct NeverPair {
    pub least_id: Uuid,
    pub greatest_id: Uuid,
}
