//! # User & Per-User State
//!
//! `User` is owned read-only by this core (profile and auth live in an
//! external collaborator) but the matching core still needs gender,
//! online/liveness, and preferences to drive candidate search, so it is
//! modeled here as a plain row type with a `sqlx::Type` enum for the
//! Postgres-native column.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[sqlx(type_name = "gender", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// A user's desired partner gender. `Any` disables the hard gender filter
/// outright (tier 3 also disables it regardless of preference, per §4.3).
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[sqlx(type_name = "gender_preference", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GenderPreference {
    Male,
    Female,
    Any,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Preferences {
    pub min_age: i16,
    pub max_age: i16,
    /// Kilometers.
    pub max_distance: f64,
    pub gender_pref: GenderPreference,
}

/// A user as seen by the matching core: identity, liveness, and the
/// preference fields the candidate finder filters on. Profile details
/// (name, photos, bio) live in the external profile store and are never
/// read here.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct User {
    pub id: Uuid,
    pub gender: Gender,
    pub age: i16,
    /// Decimal degrees.
    pub latitude: f64,
    pub longitude: f64,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cooldown_until: Option<OffsetDateTime>,
    pub min_age: i16,
    pub max_age: i16,
    pub max_distance: f64,
    pub gender_pref: GenderPreference,
}

impl User {
    pub fn preferences(&self) -> Preferences {
        Preferences {
            min_age: self.min_age,
            max_age: self.max_age,
            max_distance: self.max_distance,
            gender_pref: self.gender_pref,
        }
    }

    /// Great-circle distance to another user, in kilometers (haversine).
    pub fn distance_km(&self, other: &User) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_KM * c
    }
}

/// The finite set of states a user can occupy. Sole authority over
/// transitions between these lives in [`crate::services::state_machine`].
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[sqlx(type_name = "lifecycle_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserLifecycleState {
    Idle,
    Waiting,
    Matched,
    VoteWindow,
    VideoDate,
    Cooldown,
}

impl std::fmt::Display for UserLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserLifecycleState::Idle => "idle",
            UserLifecycleState::Waiting => "waiting",
            UserLifecycleState::Matched => "matched",
            UserLifecycleState::VoteWindow => "vote_window",
            UserLifecycleState::VideoDate => "video_date",
            UserLifecycleState::Cooldown => "cooldown",
        };
        write!(f, "{s}")
    }
}

/// Row backing one user's current place in the state machine.
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct UserState {
    pub user_id: Uuid,
    pub state: UserLifecycleState,
    pub match_id: Option<Uuid>,
    pub partner_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub waiting_since: Option<OffsetDateTime>,
    pub fairness: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
}

impl UserState {
    /// `UserState.match_id` must be non-null iff `state` is one of the
    /// three match-holding states (P5).
    pub fn invariant_match_id_consistent(&self) -> bool {
        let holds_match = matches!(
            self.state,
            UserLifecycleState::Matched
                | UserLifecycleState::VoteWindow
                | UserLifecycleState::VideoDate
        );
        holds_match == self.match_id.is_some()
    }
}
