//! # Engine Configuration
//!
//! This module defines every tunable knob the matching core reads at
//! startup. Each field has a documented default and can be overridden
//! through an environment variable, following the same documented-constant
//! style the rest of this codebase uses for its tunables.

use std::time::Duration;

/// Wait-time fairness boost: after waiting this long (continuously, once
/// each), the queue entry's fairness score gains the paired amount.
#[derive(Debug, Clone, Copy)]
pub struct WaitBoost {
    pub after: Duration,
    pub amount: i32,
}

/// Per-tier relaxation thresholds used by the candidate finder. A user
/// becomes eligible for tier `n` once they have waited at least
/// `tier_thresholds[n]`.
#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    pub tier1: Duration,
    pub tier2: Duration,
    pub tier3: Duration,
}

/// All tunables for the matching core, assembled from environment
/// variables with documented fallbacks, gathered into one struct rather
/// than a scattering of individual statics.
#[derive(Debug, Clone)]
pub struct Config {
    /// Duration of the vote_active phase. Default 15s.
    pub vote_window: Duration,
    /// How often the match tick runs. Default 2s.
    pub match_tick: Duration,
    /// How often the expiry tick runs. Default 2s.
    pub expiry_tick: Duration,
    /// How often the preference-expansion tick runs. Default 2s.
    pub expansion_tick: Duration,
    /// How often the fairness tick runs. Default 5s.
    pub fairness_tick: Duration,
    /// How often the offline-eviction tick runs. Default 10s.
    pub eviction_tick: Duration,
    /// How often the stuck-match repair tick runs. Default 10s.
    pub repair_tick: Duration,
    /// How often the cooldown tick runs. Default 10s.
    pub cooldown_tick: Duration,
    /// A user is considered offline once `last_active` is older than this.
    /// Default 30s.
    pub offline_threshold: Duration,
    /// Pair-history suppression window at tier 0. Default 5 minutes.
    pub history_cooldown: Duration,
    /// Cooldown applied after a disconnect while holding a match. Default 30s.
    pub disconnect_cooldown: Duration,
    /// Per-tier wait thresholds.
    pub tier_thresholds: TierThresholds,
    /// Fairness bonus applied to the "yes" voter on respin. Default 10.
    pub fairness_yes_boost: i32,
    /// Cumulative wait-time boosts, applied once each.
    pub wait_boosts: Vec<WaitBoost>,
    /// Maximum rows a single scheduler sub-job processes per run. Default 100.
    pub batch_size: i64,
    /// Wall-clock budget for a single command before it returns `Busy`.
    /// Default 5s.
    pub command_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vote_window: Duration::from_secs(15),
            match_tick: Duration::from_secs(2),
            expiry_tick: Duration::from_secs(2),
            expansion_tick: Duration::from_secs(2),
            fairness_tick: Duration::from_secs(5),
            eviction_tick: Duration::from_secs(10),
            repair_tick: Duration::from_secs(10),
            cooldown_tick: Duration::from_secs(10),
            offline_threshold: Duration::from_secs(30),
            history_cooldown: Duration::from_secs(5 * 60),
            disconnect_cooldown: Duration::from_secs(30),
            tier_thresholds: TierThresholds {
                tier1: Duration::from_secs(10),
                tier2: Duration::from_secs(15),
                tier3: Duration::from_secs(20),
            },
            fairness_yes_boost: 10,
            wait_boosts: vec![
                WaitBoost { after: Duration::from_secs(20), amount: 2 },
                WaitBoost { after: Duration::from_secs(40), amount: 3 },
                WaitBoost { after: Duration::from_secs(60), amount: 5 },
                WaitBoost { after: Duration::from_secs(90), amount: 8 },
            ],
            batch_size: 100,
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Builds a [`Config`] from environment variables, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            vote_window: env_duration_secs("VOTE_WINDOW_SECS", defaults.vote_window),
            match_tick: env_duration_secs("MATCH_TICK_SECS", defaults.match_tick),
            expiry_tick: env_duration_secs("EXPIRY_TICK_SECS", defaults.expiry_tick),
            expansion_tick: env_duration_secs("EXPANSION_TICK_SECS", defaults.expansion_tick),
            fairness_tick: env_duration_secs("FAIRNESS_TICK_SECS", defaults.fairness_tick),
            eviction_tick: env_duration_secs("EVICTION_TICK_SECS", defaults.eviction_tick),
            repair_tick: env_duration_secs("REPAIR_TICK_SECS", defaults.repair_tick),
            cooldown_tick: env_duration_secs("COOLDOWN_TICK_SECS", defaults.cooldown_tick),
            offline_threshold: env_duration_secs(
                "OFFLINE_THRESHOLD_SECS",
                defaults.offline_threshold,
            ),
            history_cooldown: env_duration_secs("HISTORY_COOLDOWN_SECS", defaults.history_cooldown),
            disconnect_cooldown: env_duration_secs(
                "DISCONNECT_COOLDOWN_SECS",
                defaults.disconnect_cooldown,
            ),
            tier_thresholds: TierThresholds {
                tier1: env_duration_secs("TIER1_THRESHOLD_SECS", defaults.tier_thresholds.tier1),
                tier2: env_duration_secs("TIER2_THRESHOLD_SECS", defaults.tier_thresholds.tier2),
                tier3: env_duration_secs("TIER3_THRESHOLD_SECS", defaults.tier_thresholds.tier3),
            },
            fairness_yes_boost: env_i32("FAIRNESS_YES_BOOST", defaults.fairness_yes_boost),
            wait_boosts: vec![
                WaitBoost {
                    after: env_duration_secs("WAIT_BOOST_1_AFTER_SECS", defaults.wait_boosts[0].after),
                    amount: env_i32("WAIT_BOOST_1_AMOUNT", defaults.wait_boosts[0].amount),
                },
                WaitBoost {
                    after: env_duration_secs("WAIT_BOOST_2_AFTER_SECS", defaults.wait_boosts[1].after),
                    amount: env_i32("WAIT_BOOST_2_AMOUNT", defaults.wait_boosts[1].amount),
                },
                WaitBoost {
                    after: env_duration_secs("WAIT_BOOST_3_AFTER_SECS", defaults.wait_boosts[2].after),
                    amount: env_i32("WAIT_BOOST_3_AMOUNT", defaults.wait_boosts[2].amount),
                },
                WaitBoost {
                    after: env_duration_secs("WAIT_BOOST_4_AFTER_SECS", defaults.wait_boosts[3].after),
                    amount: env_i32("WAIT_BOOST_4_AMOUNT", defaults.wait_boosts[3].amount),
                },
            ],
            batch_size: std::env::var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            command_timeout: env_duration_secs("COMMAND_TIMEOUT_SECS", defaults.command_timeout),
        }
    }
}

fn env_duration_secs(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| {
            tracing::debug!(key, "using default for config knob");
            fallback
        })
}

fn env_i32(key: &str, fallback: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or_else(|| {
            tracing::debug!(key, "using default for config knob");
            fallback
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covering all three knobs together; env vars are process-global,
    // so a single test that sets and restores them avoids racing other tests
    // in this module.
    #[test]
    fn from_env_overrides_tier_thresholds_wait_boosts_and_yes_boost() {
        let vars = [
            ("TIER1_THRESHOLD_SECS", "11"),
            ("TIER2_THRESHOLD_SECS", "22"),
            ("TIER3_THRESHOLD_SECS", "33"),
            ("FAIRNESS_YES_BOOST", "7"),
            ("WAIT_BOOST_1_AFTER_SECS", "21"),
            ("WAIT_BOOST_1_AMOUNT", "1"),
            ("WAIT_BOOST_2_AFTER_SECS", "41"),
            ("WAIT_BOOST_2_AMOUNT", "4"),
            ("WAIT_BOOST_3_AFTER_SECS", "61"),
            ("WAIT_BOOST_3_AMOUNT", "6"),
            ("WAIT_BOOST_4_AFTER_SECS", "91"),
            ("WAIT_BOOST_4_AMOUNT", "9"),
        ];
        for (key, value) in vars {
            // SAFETY: test-only, single-threaded within this function's scope.
            unsafe { std::env::set_var(key, value) };
        }

        let config = Config::from_env();

        assert_eq!(config.tier_thresholds.tier1, Duration::from_secs(11));
        assert_eq!(config.tier_thresholds.tier2, Duration::from_secs(22));
        assert_eq!(config.tier_thresholds.tier3, Duration::from_secs(33));
        assert_eq!(config.fairness_yes_boost, 7);
        assert_eq!(config.wait_boosts[0].after, Duration::from_secs(21));
        assert_eq!(config.wait_boosts[0].amount, 1);
        assert_eq!(config.wait_boosts[3].after, Duration::from_secs(91));
        assert_eq!(config.wait_boosts[3].amount, 9);

        for (key, _) in vars {
            // SAFETY: test-only cleanup, same scope as the sets above.
            unsafe { std::env::remove_var(key) };
        }
    }
}
