//! # Domain Events
//!
//! Facts, not commands. The transport layer (out of scope here) fans
//! these out to clients over push and/or poll. Consumers must tolerate
//! at-least-once delivery and duplicate events, so every event is also
//! appended to a persisted log inside the same transaction as the
//! mutation it describes.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{MatchId, Outcome, UserLifecycleState, VoteValue};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Spun {
        user_id: Uuid,
    },
    MatchCreated {
        match_id: MatchId,
        user1_id: Uuid,
        user2_id: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        vote_window_expires_at: OffsetDateTime,
    },
    VoteRecorded {
        match_id: MatchId,
        user_id: Uuid,
        value: VoteValue,
    },
    MatchCompleted {
        match_id: MatchId,
        outcome: Outcome,
    },
    UserStateChanged {
        user_id: Uuid,
        state: UserLifecycleState,
        match_id: Option<MatchId>,
    },
    Evicted {
        user_id: Uuid,
        reason: String,
    },
}

/// An event as it sits in the log: the fact plus delivery metadata.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
