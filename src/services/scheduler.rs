//! # Scheduler
//!
//! Owns every background reconciliation job: one `tokio::spawn`ed loop per
//! concern, each on its own `tokio::time::interval`, each batched and run
//! inside its own transaction so a slow or failing tick never blocks the
//! others.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{error, instrument, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::AppResult;
use crate::models::UserLifecycleState;
use crate::services::candidate_finder::CandidateFinder;
use crate::services::events::{EventPublisher, StoredEventPublisher};
use crate::services::locks::AdvisoryLocks;
use crate::services::pair_creator::{PairCreator, PairOutcome};
use crate::services::state_machine::{Cause, StateMachine};
use crate::services::vote_resolver::VoteResolver;

/// Bundles every collaborator a reconciler tick needs. Cheaply cloneable:
/// every field is already an `Arc` or a pool handle.
#[derive(Clone)]
pub struct Scheduler {
    db_pool: PgPool,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    locks: Arc<AdvisoryLocks>,
    events: Arc<StoredEventPublisher>,
}

impl Scheduler {
    pub fn new(
        db_pool: PgPool,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
        locks: Arc<AdvisoryLocks>,
        events: Arc<StoredEventPublisher>,
    ) -> Self {
        Self { db_pool, clock, config, locks, events }
    }

    /// Spawns every reconciler as its own task and returns immediately.
    /// The process runs them for its lifetime; tests can abort the
    /// returned handles for teardown.
    pub fn run(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_tick("match", self.config.match_tick, |s| Box::pin(s.match_tick())),
            self.spawn_tick("expiry", self.config.expiry_tick, |s| Box::pin(s.expiry_tick())),
            self.spawn_tick("expansion", self.config.expansion_tick, |s| {
                Box::pin(s.expansion_tick())
            }),
            self.spawn_tick("fairness", self.config.fairness_tick, |s| Box::pin(s.fairness_tick())),
            self.spawn_tick("eviction", self.config.eviction_tick, |s| Box::pin(s.eviction_tick())),
            self.spawn_tick("repair", self.config.repair_tick, |s| Box::pin(s.repair_tick())),
            self.spawn_tick("cooldown", self.config.cooldown_tick, |s| Box::pin(s.cooldown_tick())),
        ]
    }

    fn spawn_tick(
        &self,
        name: &'static str,
        period: std::time::Duration,
        job: fn(Self) -> std::pin::Pin<Box<dyn std::future::Future<Output = AppResult<()>> + Send>>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick completes immediately
            loop {
                interval.tick().await;
                if let Err(err) = job(this.clone()).await {
                    error!(tick = name, error = %err, "reconciler tick failed");
                }
            }
        })
    }

    /// Pulls waiting users ordered by `fairness DESC, joined_at ASC` and
    /// tries to pair each against its best candidate at its current tier.
    /// Lock contention and re-validation failures are expected under
    /// concurrency and are not logged as errors.
    #[instrument(skip(self))]
    pub async fn match_tick(self) -> AppResult<()> {
        let waiting = fetch_waiting_users(&self.db_pool, self.config.batch_size).await?;
        for (user, joined_at) in waiting {
            self.try_match_one(&user, joined_at).await?;
        }
        Ok(())
    }

    /// Attempts a single match for `user`, who joined the queue at
    /// `joined_at`. Used both by the periodic match tick and by `Spin`'s
    /// immediate attempt so a user doesn't have to wait for the next tick
    /// to be paired against someone already waiting. `create_pair` takes
    /// the advisory lock on `user.id` itself as part of its lock pair.
    pub(crate) async fn try_match_one(
        &self,
        user: &crate::models::User,
        joined_at: time::OffsetDateTime,
    ) -> AppResult<Option<crate::models::MatchId>> {
        let now = self.clock.now();
        let tier = CandidateFinder::tier_for_wait(&self.config, waited_duration(now, joined_at));
        let Some(candidate_id) = CandidateFinder::find_candidate(
            &self.db_pool,
            self.clock.as_ref(),
            &self.config,
            user,
            tier,
        )
        .await?
        else {
            return Ok(None);
        };

        match PairCreator::create_pair(
            &self.db_pool,
            self.clock.as_ref(),
            &self.config,
            &self.locks,
            self.events.as_ref(),
            user.id,
            candidate_id,
            tier,
        )
        .await?
        {
            PairOutcome::Created(m) => {
                tracing::info!(match_id = %m.id, "created pair");
                Ok(Some(m.id))
            }
            PairOutcome::Busy | PairOutcome::NoMatch => Ok(None),
        }
    }

    /// Resolves vote windows that have run out without a mutual decision.
    #[instrument(skip(self))]
    pub async fn expiry_tick(self) -> AppResult<()> {
        let resolved = VoteResolver::resolve_expired(
            &self.db_pool,
            self.clock.as_ref(),
            &self.config,
            self.events.as_ref(),
            self.config.batch_size,
        )
        .await?;
        if resolved > 0 {
            tracing::debug!(resolved, "expired vote windows resolved");
        }
        Ok(())
    }

    /// Advances each queue entry's `preference_stage` once it qualifies
    /// for a higher tier, so the next `match_tick` search uses the wider
    /// rules.
    #[instrument(skip(self))]
    pub async fn expansion_tick(self) -> AppResult<()> {
        let now = self.clock.now();
        let entries = sqlx::query!(
            r#"
            SELECT user_id, joined_at, preference_stage
            FROM queue
            ORDER BY joined_at ASC
            LIMIT $1
            "#,
            self.config.batch_size
        )
        .fetch_all(&self.db_pool)
        .await?;

        for row in entries {
            let waited = waited_duration(now, row.joined_at);
            let tier = CandidateFinder::tier_for_wait(&self.config, waited) as i16;
            if tier > row.preference_stage {
                sqlx::query!(
                    "UPDATE queue SET preference_stage = $2, last_expanded_at = $3 WHERE user_id = $1",
                    row.user_id,
                    tier,
                    now
                )
                .execute(&self.db_pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Applies cumulative wait-time fairness boosts.
    #[instrument(skip(self))]
    pub async fn fairness_tick(self) -> AppResult<()> {
        use crate::services::fairness::FairnessEngine;

        let now = self.clock.now();
        let entries = sqlx::query!(
            r#"SELECT user_id, joined_at, wait_boost_applied FROM queue ORDER BY joined_at ASC LIMIT $1"#,
            self.config.batch_size
        )
        .fetch_all(&self.db_pool)
        .await?;

        for row in entries {
            let waited = waited_duration(now, row.joined_at);
            if !FairnessEngine::may_be_due(&self.config, waited) {
                continue;
            }
            // `wait_boost_applied` tracks only the wait-time ladder's own
            // running total, kept apart from `fairness` (which also carries
            // the respin yes-boost), so this increment isn't swallowed by
            // an unrelated boost mixed into the same counter.
            let increment =
                FairnessEngine::wait_time_boost_increment(&self.config, row.wait_boost_applied, waited);
            if increment > 0 {
                sqlx::query!(
                    r#"
                    UPDATE queue
                    SET fairness = fairness + $2, wait_boost_applied = wait_boost_applied + $2
                    WHERE user_id = $1
                    "#,
                    row.user_id,
                    increment
                )
                .execute(&self.db_pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Evicts users whose `last_active` has exceeded `offline_threshold`
    /// from the queue and marks them `idle`, so a dead connection can't
    /// occupy a candidate slot forever.
    #[instrument(skip(self))]
    pub async fn eviction_tick(self) -> AppResult<()> {
        let cutoff = self.clock.now() - self.config.offline_threshold;
        let stale = sqlx::query!(
            r#"
            SELECT q.user_id
            FROM queue q
            JOIN users u ON u.id = q.user_id
            WHERE u.last_active < $1 OR u.online = false
            LIMIT $2
            "#,
            cutoff,
            self.config.batch_size
        )
        .fetch_all(&self.db_pool)
        .await?;

        for row in stale {
            let mut tx = self.db_pool.begin().await?;
            let state = sqlx::query!(
                r#"SELECT state as "state: UserLifecycleState" FROM user_state WHERE user_id = $1 FOR UPDATE"#,
                row.user_id
            )
            .fetch_optional(tx.as_mut())
            .await?;

            let Some(state) = state else {
                tx.rollback().await?;
                continue;
            };

            if StateMachine::transition(state.state, Cause::Evicted).is_err() {
                // Already in a state eviction doesn't apply to (e.g. idle).
                tx.rollback().await?;
                continue;
            }

            sqlx::query!("DELETE FROM queue WHERE user_id = $1", row.user_id)
                .execute(tx.as_mut())
                .await?;
            sqlx::query!(
                "UPDATE user_state SET state = 'idle', match_id = NULL, partner_id = NULL, waiting_since = NULL, fairness = 0 WHERE user_id = $1",
                row.user_id
            )
            .execute(tx.as_mut())
            .await?;
            sqlx::query!(
                r#"
                INSERT INTO state_transitions (user_id, from_state, to_state, cause, created_at)
                VALUES ($1, 'waiting', 'idle', $2, $3)
                "#,
                row.user_id,
                Cause::Evicted.as_str(),
                self.clock.now()
            )
            .execute(tx.as_mut())
            .await?;

            self.events
                .publish(
                    &mut tx,
                    crate::models::EventKind::Evicted {
                        user_id: row.user_id,
                        reason: "offline".to_string(),
                    },
                )
                .await?;

            tx.commit().await?;
        }
        Ok(())
    }

    /// Repairs matches stuck `paired` past a grace period (e.g. a worker
    /// crashed between inserting the match and opening its vote window)
    /// by opening the vote window late rather than leaving participants
    /// stranded indefinitely. Also force-resolves any `vote_active` match
    /// that outlived its expiry by more than one repair interval, in case
    /// the expiry tick missed it (e.g. it was down for a cycle).
    #[instrument(skip(self))]
    pub async fn repair_tick(self) -> AppResult<()> {
        let now = self.clock.now();
        let grace = self.config.vote_window + self.config.repair_tick;
        let stuck = sqlx::query!(
            r#"
            SELECT id FROM matches
            WHERE status = 'paired' AND created_at < $1
            LIMIT $2
            "#,
            now - grace,
            self.config.batch_size
        )
        .fetch_all(&self.db_pool)
        .await?;

        for row in stuck {
            warn!(match_id = %row.id, "repairing match stuck in paired status");
            sqlx::query!(
                r#"
                UPDATE matches
                SET status = 'vote_active', vote_window_started_at = $2, vote_window_expires_at = $3
                WHERE id = $1 AND status = 'paired'
                "#,
                row.id,
                now,
                now + self.config.vote_window
            )
            .execute(&self.db_pool)
            .await?;
        }

        let overdue = sqlx::query!(
            r#"
            SELECT id FROM matches
            WHERE status = 'vote_active' AND vote_window_expires_at < $1
            LIMIT $2
            "#,
            now - self.config.repair_tick,
            self.config.batch_size
        )
        .fetch_all(&self.db_pool)
        .await?;

        if !overdue.is_empty() {
            warn!(count = overdue.len(), "force-resolving vote windows the expiry tick missed");
            VoteResolver::resolve_expired(
                &self.db_pool,
                self.clock.as_ref(),
                &self.config,
                self.events.as_ref(),
                self.config.batch_size,
            )
            .await?;
        }
        Ok(())
    }

    /// Releases users whose disconnect cooldown has elapsed back to idle.
    #[instrument(skip(self))]
    pub async fn cooldown_tick(self) -> AppResult<()> {
        let now = self.clock.now();
        let expired = sqlx::query!(
            r#"
            SELECT us.user_id FROM user_state us
            JOIN users u ON u.id = us.user_id
            WHERE us.state = 'cooldown' AND u.cooldown_until IS NOT NULL AND u.cooldown_until < $1
            LIMIT $2
            "#,
            now,
            self.config.batch_size
        )
        .fetch_all(&self.db_pool)
        .await?;

        for row in expired {
            if StateMachine::transition(UserLifecycleState::Cooldown, Cause::CooldownElapsed).is_err() {
                continue;
            }

            let mut tx = self.db_pool.begin().await?;
            sqlx::query!("UPDATE user_state SET state = 'idle' WHERE user_id = $1", row.user_id)
                .execute(tx.as_mut())
                .await?;
            sqlx::query!("UPDATE users SET cooldown_until = NULL WHERE id = $1", row.user_id)
                .execute(tx.as_mut())
                .await?;
            sqlx::query!(
                r#"
                INSERT INTO state_transitions (user_id, from_state, to_state, cause, created_at)
                VALUES ($1, 'cooldown', 'idle', $2, $3)
                "#,
                row.user_id,
                Cause::CooldownElapsed.as_str(),
                now
            )
            .execute(tx.as_mut())
            .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

fn waited_duration(now: time::OffsetDateTime, since: time::OffsetDateTime) -> std::time::Duration {
    (now - since).max(time::Duration::ZERO).try_into().unwrap_or_default()
}

async fn fetch_waiting_users(
    db_pool: &PgPool,
    limit: i64,
) -> AppResult<Vec<(crate::models::User, time::OffsetDateTime)>> {
    let rows = sqlx::query!(
        r#"
        SELECT
            u.id, u.gender as "gender: crate::models::Gender", u.age, u.latitude, u.longitude,
            u.online, u.last_active, u.cooldown_until,
            u.min_age, u.max_age, u.max_distance,
            u.gender_pref as "gender_pref: crate::models::GenderPreference",
            q.joined_at
        FROM queue q
        JOIN users u ON u.id = q.user_id
        ORDER BY q.fairness DESC, q.joined_at ASC
        LIMIT $1
        "#,
        limit
    )
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let user = crate::models::User {
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
            (user, row.joined_at)
        })
        .collect())
}
