//! # Fairness Engine
//!
//! Assigns each queue entry a non-negative integer score used as the
//! primary sort key for candidate selection. Scores never decrease while
//! in queue and reset to zero on exit.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Config;
use crate::models::QueueEntry;

pub struct FairnessEngine;

impl FairnessEngine {
    /// Fairness bonus applied to the "yes" voter re-entering the queue
    /// after a `yes_pass` or `yes_idle` outcome.
    pub fn respin_boost(config: &Config) -> i32 {
        config.fairness_yes_boost
    }

    /// Sum of every wait-time boost an entry has newly crossed since
    /// `last_expanded_reference` (the instant boosts were last applied),
    /// given it has now waited `waited_for`. Each threshold applies once;
    /// callers persist the new cumulative total back onto the entry.
    pub fn wait_time_boost_increment(
        config: &Config,
        previously_applied: i32,
        waited_for: std::time::Duration,
    ) -> i32 {
        let mut eligible_total = 0;
        for boost in &config.wait_boosts {
            if waited_for >= boost.after {
                eligible_total += boost.amount;
            }
        }
        (eligible_total - previously_applied).max(0)
    }

    /// Orders candidates by `fairness DESC, joined_at ASC`, breaking ties
    /// with a deterministic pseudo-random value seeded by `(user_id,
    /// candidate_id)` so that repeated comparisons of the same pair are
    /// stable but no single ordering is gameable across different pairs.
    pub fn compare_candidates(
        requester: Uuid,
        a: &QueueEntry,
        b: &QueueEntry,
    ) -> std::cmp::Ordering {
        b.fairness
            .cmp(&a.fairness)
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| {
                tiebreak_seed(requester, a.user_id).cmp(&tiebreak_seed(requester, b.user_id))
            })
    }

    /// True once the wait exceeds the oldest configured boost threshold,
    /// used by the fairness tick to skip entries that can't possibly be
    /// due yet.
    pub fn may_be_due(config: &Config, waited_for: std::time::Duration) -> bool {
        config
            .wait_boosts
            .first()
            .is_none_or(|b| waited_for >= b.after)
    }

}

/// A stable 64-bit tiebreaker for a `(requester, candidate)` pair, used
/// only to order otherwise-equal candidates without favoring any
/// particular candidate across different requesters (discourages
/// livelock).
fn tiebreak_seed(requester: Uuid, candidate: Uuid) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    requester.hash(&mut hasher);
    candidate.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_time_boosts_are_cumulative_and_applied_once() {
        let config = Config::default();

        // At 25s, only the 20s boost (+2) has been crossed.
        let inc = FairnessEngine::wait_time_boost_increment(
            &config,
            0,
            std::time::Duration::from_secs(25),
        );
        assert_eq!(inc, 2);

        // At 65s, 20s+40s+60s boosts total +10; having already applied +2,
        // the increment is +8.
        let inc = FairnessEngine::wait_time_boost_increment(
            &config,
            2,
            std::time::Duration::from_secs(65),
        );
        assert_eq!(inc, 8);

        // Calling again at the same wait yields no further increment.
        let inc = FairnessEngine::wait_time_boost_increment(
            &config,
            10,
            std::time::Duration::from_secs(65),
        );
        assert_eq!(inc, 0);
    }

    #[test]
    fn respin_boost_does_not_suppress_wait_time_boosts() {
        // A respin user's `fairness` total starts at the +10 yes-boost,
        // but `wait_boost_applied` (what this function is keyed on) starts
        // at 0 for the new dwell, so the 20s boost still lands in full.
        let config = Config::default();
        let inc = FairnessEngine::wait_time_boost_increment(
            &config,
            0,
            std::time::Duration::from_secs(25),
        );
        assert_eq!(inc, 2);
    }

    #[test]
    fn candidate_ordering_prefers_higher_fairness_then_earlier_join() {
        let now = OffsetDateTime::now_utc();
        let requester = Uuid::new_v4();

        let high_fairness = QueueEntry {
            user_id: Uuid::new_v4(),
            joined_at: now,
            fairness: 10,
            wait_boost_applied: 0,
            preference_stage: 0,
            last_expanded_at: None,
        };
        let low_fairness = QueueEntry {
            user_id: Uuid::new_v4(),
            joined_at: now - time::Duration::seconds(5),
            fairness: 0,
            wait_boost_applied: 0,
            preference_stage: 0,
            last_expanded_at: None,
        };

        assert_eq!(
            FairnessEngine::compare_candidates(requester, &high_fairness, &low_fairness),
            std::cmp::Ordering::Less
        );
    }
}
