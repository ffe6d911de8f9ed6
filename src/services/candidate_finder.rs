//! # Candidate Finder
//!
//! Given `(user_id, tier)`, returns at most one eligible partner id.
//! Failure is "no candidate", never an error. The scheduler simply
//! tries again next tick.

use std::collections::HashSet;

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::AppResult;
use crate::models::{GenderPreference, QueueEntry, User};
use crate::services::fairness::FairnessEngine;

pub struct CandidateFinder;

/// Per-tier relaxation of the hard filters, resolved once per search so
/// the comparison logic stays tier-agnostic.
struct TierRules {
    age_tolerance: i16,
    distance_multiplier: f64,
    ignore_gender_pref: bool,
    allow_recent_history: bool,
}

impl TierRules {
    fn for_tier(tier: u8) -> TierRules {
        match tier {
            0 => TierRules {
                age_tolerance: 0,
                distance_multiplier: 1.0,
                ignore_gender_pref: false,
                allow_recent_history: false,
            },
            1 => TierRules {
                age_tolerance: 5,
                distance_multiplier: 1.0,
                ignore_gender_pref: false,
                allow_recent_history: true,
            },
            2 => TierRules {
                age_tolerance: 10,
                distance_multiplier: 2.0,
                ignore_gender_pref: false,
                allow_recent_history: true,
            },
            _ => TierRules {
                age_tolerance: i16::MAX,
                distance_multiplier: f64::INFINITY,
                ignore_gender_pref: true,
                allow_recent_history: true,
            },
        }
    }
}

/// Re-derivable hard-filter check (liveness, gender, age, distance) with
/// no history lookups, so [`crate::services::pair_creator`] can
/// re-validate a pair under lock without duplicating this logic.
pub fn core_filters_ok(requester: &User, candidate: &User, tier: u8, now: OffsetDateTime) -> bool {
    let rules = TierRules::for_tier(tier);
    CandidateFinder::is_eligible(requester, candidate, &rules, now, &HashSet::new(), &HashSet::new())
}

impl CandidateFinder {
    /// Resolves the tier a queue entry currently qualifies for, based on
    /// how long it has continuously waited (the threshold
    /// table, also used by the preference-expansion tick).
    pub fn tier_for_wait(config: &Config, waited_for: std::time::Duration) -> u8 {
        if waited_for >= config.tier_thresholds.tier3 {
            3
        } else if waited_for >= config.tier_thresholds.tier2 {
            2
        } else if waited_for >= config.tier_thresholds.tier1 {
            1
        } else {
            0
        }
    }

    /// Finds the best eligible candidate for `user` at `tier`, or `None`
    /// if nobody currently in the queue qualifies.
    #[instrument(skip(db_pool, clock), fields(user_id = %user.id, tier))]
    pub async fn find_candidate(
        db_pool: &PgPool,
        clock: &dyn Clock,
        config: &Config,
        user: &User,
        tier: u8,
    ) -> AppResult<Option<Uuid>> {
        let rules = TierRules::for_tier(tier);
        let now = clock.now();

        let waiting_candidates = fetch_waiting_candidates(db_pool, user.id).await?;
        if waiting_candidates.is_empty() {
            return Ok(None);
        }

        let never_paired = fetch_never_pair_partners(db_pool, user.id).await?;
        let recently_paired = if rules.allow_recent_history {
            HashSet::new()
        } else {
            fetch_recent_history_partners(db_pool, user.id, now - config.history_cooldown).await?
        };

        let mut eligible: Vec<(User, QueueEntry)> = Vec::new();
        for (candidate, entry) in waiting_candidates {
            if !Self::is_eligible(user, &candidate, &rules, now, &never_paired, &recently_paired) {
                continue;
            }
            eligible.push((candidate, entry));
        }

        eligible.sort_by(|(_, a), (_, b)| FairnessEngine::compare_candidates(user.id, a, b));

        let chosen = eligible.into_iter().next().map(|(candidate, _)| candidate.id);
        trace!(found = chosen.is_some(), "candidate search completed");
        Ok(chosen)
    }

    fn is_eligible(
        requester: &User,
        candidate: &User,
        rules: &TierRules,
        now: OffsetDateTime,
        never_paired: &HashSet<Uuid>,
        recently_paired: &HashSet<Uuid>,
    ) -> bool {
        if candidate.id == requester.id {
            return false;
        }

        if !candidate.online || (now - candidate.last_active) > time::Duration::seconds(10) {
            return false;
        }

        if never_paired.contains(&candidate.id) {
            return false;
        }

        if recently_paired.contains(&candidate.id) {
            return false;
        }

        if !rules.ignore_gender_pref && !gender_compatible(requester, candidate) {
            return false;
        }

        let age_tolerance = rules.age_tolerance;
        let min_age = requester.min_age.saturating_sub(age_tolerance);
        let max_age = requester.max_age.saturating_add(age_tolerance);
        if !(min_age..=max_age).contains(&candidate.age) && rules.age_tolerance != i16::MAX {
            return false;
        }

        if rules.distance_multiplier.is_finite() {
            let allowed_distance = requester.max_distance * rules.distance_multiplier;
            if requester.distance_km(candidate) > allowed_distance {
                return false;
            }
        }

        true
    }
}

fn gender_compatible(a: &User, b: &User) -> bool {
    let a_wants_b = match a.gender_pref {
        GenderPreference::Male => b.gender == crate::models::Gender::Male,
        GenderPreference::Female => b.gender == crate::models::Gender::Female,
        GenderPreference::Any => true,
    };
    let b_wants_a = match b.gender_pref {
        GenderPreference::Male => a.gender == crate::models::Gender::Male,
        GenderPreference::Female => a.gender == crate::models::Gender::Female,
        GenderPreference::Any => true,
    };
    a_wants_b && b_wants_a
}

async fn fetch_waiting_candidates(
    db_pool: &PgPool,
    exclude_user_id: Uuid,
) -> AppResult<Vec<(User, QueueEntry)>> {
    let rows = sqlx::query!(
        r#"
        SELECT
            u.id, u.gender as "gender: crate::models::Gender", u.age, u.latitude, u.longitude,
            u.online, u.last_active, u.cooldown_until,
            u.min_age, u.max_age, u.max_distance,
            u.gender_pref as "gender_pref: crate::models::GenderPreference",
            q.joined_at, q.fairness, q.wait_boost_applied, q.preference_stage, q.last_expanded_at
        FROM queue q
        JOIN users u ON u.id = q.user_id
        JOIN user_state us ON us.user_id = u.id
        WHERE us.state = 'waiting' AND u.id != $1
        "#,
        exclude_user_id
    )
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let user = User {
                id: row.id,
                gender: row.gender,
                age: row.age,
                latitude: row.latitude,
                longitude: row.longitude,
                online: row.online,
                last_active: row.last_active,
                cooldown_until: row.cooldown_until,
                min_age: row.min_age,
                max_age: row.max_age,
                max_distance: row.max_distance,
                gender_pref: row.gender_pref,
            };
            let entry = QueueEntry {
                user_id: row.id,
                joined_at: row.joined_at,
                fairness: row.fairness,
                wait_boost_applied: row.wait_boost_applied,
                preference_stage: row.preference_stage,
                last_expanded_at: row.last_expanded_at,
            };
            (user, entry)
        })
        .collect())
}

async fn fetch_never_pair_partners(db_pool: &PgPool, user_id: Uuid) -> AppResult<HashSet<Uuid>> {
    let rows = sqlx::query!(
        r#"
        SELECT least_id, greatest_id FROM never_pair
        WHERE least_id = $1 OR greatest_id = $1
        "#,
        user_id
    )
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| if row.least_id == user_id { row.greatest_id } else { row.least_id })
        .collect())
}

async fn fetch_recent_history_partners(
    db_pool: &PgPool,
    user_id: Uuid,
    since: OffsetDateTime,
) -> AppResult<HashSet<Uuid>> {
    let rows = sqlx::query!(
        r#"
        SELECT user1_id, user2_id FROM pair_history
        WHERE (user1_id = $1 OR user2_id = $1) AND last_matched_at > $2
        "#,
        user_id,
        since
    )
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| if row.user1_id == user_id { row.user2_id } else { row.user1_id })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: Uuid, gender: crate::models::Gender, age: i16) -> User {
        User {
            id,
            gender,
            age,
            latitude: 0.0,
            longitude: 0.0,
            online: true,
            last_active: OffsetDateTime::now_utc(),
            cooldown_until: None,
            min_age: 18,
            max_age: 99,
            max_distance: 50.0,
            gender_pref: GenderPreference::Any,
        }
    }

    #[test]
    fn tier_thresholds_match_config() {
        let config = Config::default();
        assert_eq!(CandidateFinder::tier_for_wait(&config, std::time::Duration::from_secs(5)), 0);
        assert_eq!(CandidateFinder::tier_for_wait(&config, std::time::Duration::from_secs(12)), 1);
        assert_eq!(CandidateFinder::tier_for_wait(&config, std::time::Duration::from_secs(16)), 2);
        assert_eq!(CandidateFinder::tier_for_wait(&config, std::time::Duration::from_secs(25)), 3);
    }

    #[test]
    fn offline_candidate_is_never_eligible() {
        let requester = user(Uuid::new_v4(), crate::models::Gender::Male, 25);
        let mut candidate = user(Uuid::new_v4(), crate::models::Gender::Female, 25);
        candidate.online = false;

        let rules = TierRules::for_tier(0);
        assert!(!CandidateFinder::is_eligible(
            &requester,
            &candidate,
            &rules,
            OffsetDateTime::now_utc(),
            &HashSet::new(),
            &HashSet::new(),
        ));
    }

    #[test]
    fn tier_3_ignores_gender_preference() {
        let mut requester = user(Uuid::new_v4(), crate::models::Gender::Male, 25);
        requester.gender_pref = GenderPreference::Female;
        let mut candidate = user(Uuid::new_v4(), crate::models::Gender::Male, 25);
        candidate.gender_pref = GenderPreference::Female;

        let rules = TierRules::for_tier(3);
        assert!(CandidateFinder::is_eligible(
            &requester,
            &candidate,
            &rules,
            OffsetDateTime::now_utc(),
            &HashSet::new(),
            &HashSet::new(),
        ));

        let rules = TierRules::for_tier(0);
        assert!(!CandidateFinder::is_eligible(
            &requester,
            &candidate,
            &rules,
            OffsetDateTime::now_utc(),
            &HashSet::new(),
            &HashSet::new(),
        ));
    }

    #[test]
    fn never_pair_blocks_at_every_tier() {
        let requester = user(Uuid::new_v4(), crate::models::Gender::Male, 25);
        let candidate = user(Uuid::new_v4(), crate::models::Gender::Female, 25);
        let mut never_paired = HashSet::new();
        never_paired.insert(candidate.id);

        for tier in 0..=3 {
            let rules = TierRules::for_tier(tier);
            assert!(!CandidateFinder::is_eligible(
                &requester,
                &candidate,
                &rules,
                OffsetDateTime::now_utc(),
                &never_paired,
                &HashSet::new(),
            ));
        }
    }
}
