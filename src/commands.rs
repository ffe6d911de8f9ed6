//! # Command API
//!
//! The matching core's only external surface: every mutation a transport
//! layer can request goes through [`Engine`]. There is no HTTP framework
//! wired up here, a transport crate is expected to call these methods
//! directly.

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{MatchId, MatchStatus, UserLifecycleState, VoteValue};
use crate::services::events::{EventPublisher, StoredEventPublisher};
use crate::services::locks::AdvisoryLocks;
use crate::services::scheduler::Scheduler;
use crate::services::state_machine::{Cause, StateMachine};
use crate::services::vote_resolver::{VoteOutcome, VoteResolver};

/// A snapshot of one user's current position in the system, returned by
/// [`Engine::get_match_status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct MatchStatusView {
    pub state: UserLifecycleState,
    pub match_id: Option<MatchId>,
    pub partner_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub vote_window_expires_at: Option<OffsetDateTime>,
}

/// The matching core's command surface. Holds every collaborator a
/// command needs; cheap to clone, cheap to hold across `await` points.
#[derive(Clone)]
pub struct Engine {
    db_pool: PgPool,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    locks: Arc<AdvisoryLocks>,
    events: Arc<StoredEventPublisher>,
    /// Shares its lock table and event publisher with this engine so a
    /// `Spin`-triggered immediate match attempt is indistinguishable from
    /// one made by the periodic match tick.
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(
        db_pool: PgPool,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
        locks: Arc<AdvisoryLocks>,
        events: Arc<StoredEventPublisher>,
    ) -> Self {
        let scheduler = Scheduler::new(
            db_pool.clone(),
            Arc::clone(&clock),
            Arc::clone(&config),
            Arc::clone(&locks),
            Arc::clone(&events),
        );
        Self { db_pool, clock, config, locks, events, scheduler }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<crate::models::Event> {
        self.events.subscribe()
    }

    /// `Spin(user_id)`: enters the queue. Rejects a user already queued,
    /// matched, or cooling down; rejects an offline user. Triggers an
    /// immediate match attempt for this user so they don't have to wait
    /// for the next scheduled match tick.
    #[instrument(skip(self), fields(%user_id))]
    pub async fn spin(&self, user_id: Uuid) -> AppResult<()> {
        self.with_timeout(self.spin_inner(user_id)).await
    }

    async fn spin_inner(&self, user_id: Uuid) -> AppResult<()> {
        let now = self.clock.now();
        let mut tx = self.db_pool.begin().await?;

        let current = current_state(&mut tx, user_id).await?;
        match current {
            UserLifecycleState::Waiting => return Err(AppError::AlreadyQueued),
            UserLifecycleState::Matched
            | UserLifecycleState::VoteWindow
            | UserLifecycleState::VideoDate => return Err(AppError::AlreadyMatched),
            UserLifecycleState::Cooldown => return Err(AppError::InCooldown),
            UserLifecycleState::Idle => {}
        }
        let next = StateMachine::transition(current, Cause::Spin)?;

        let row = sqlx::query!("SELECT online, cooldown_until FROM users WHERE id = $1", user_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or(AppError::UnknownUser)?;

        if let Some(until) = row.cooldown_until {
            if now < until {
                return Err(AppError::InCooldown);
            }
        }
        if !row.online {
            return Err(AppError::UserOffline);
        }

        sqlx::query!(
            r#"
            UPDATE user_state
            SET state = $2, waiting_since = $3, last_active = $3
            WHERE user_id = $1
            "#,
            user_id,
            next as UserLifecycleState,
            now
        )
        .execute(tx.as_mut())
        .await?;

        sqlx::query!(
            r#"
            INSERT INTO queue (user_id, joined_at, fairness, wait_boost_applied, preference_stage)
            VALUES ($1, $2, 0, 0, 0)
            ON CONFLICT (user_id) DO UPDATE SET joined_at = EXCLUDED.joined_at
            "#,
            user_id,
            now
        )
        .execute(tx.as_mut())
        .await?;

        self.events.publish(&mut tx, crate::models::EventKind::Spun { user_id }).await?;
        self.events
            .publish(
                &mut tx,
                crate::models::EventKind::UserStateChanged { user_id, state: next, match_id: None },
            )
            .await?;

        tx.commit().await?;

        // Spin triggers an immediate match attempt for this user instead
        // of leaving them to wait for the next scheduled match tick.
        if let Some(user) = fetch_user(&self.db_pool, user_id).await? {
            self.scheduler.try_match_one(&user, now).await?;
        }

        Ok(())
    }

    /// `Heartbeat(user_id)`: liveness ping. Keeps a waiting or matched
    /// user from being evicted by the offline reconciler.
    #[instrument(skip(self), fields(%user_id))]
    pub async fn heartbeat(&self, user_id: Uuid) -> AppResult<()> {
        self.with_timeout(async {
            let now = self.clock.now();
            let result = sqlx::query!(
                "UPDATE users SET last_active = $2, online = true WHERE id = $1",
                user_id,
                now
            )
            .execute(&self.db_pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(AppError::UnknownUser);
            }
            Ok(())
        })
        .await
    }

    /// `Acknowledge(match_id, user_id)`: retained as a no-op for
    /// compatibility with older clients. The vote window is opened
    /// immediately by the Pair Creator, so acknowledging is never
    /// required to progress a match, this just confirms the window is
    /// open and reports its expiry.
    #[instrument(skip(self), fields(%match_id, %user_id))]
    pub async fn acknowledge(&self, match_id: MatchId, user_id: Uuid) -> AppResult<OffsetDateTime> {
        self.with_timeout(async {
            let row = sqlx::query!(
                r#"
                SELECT user1_id, user2_id, status as "status: MatchStatus", vote_window_expires_at
                FROM matches WHERE id = $1
                "#,
                match_id
            )
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or(AppError::InvalidMatch)?;

            if row.user1_id != user_id && row.user2_id != user_id {
                return Err(AppError::NotParticipant);
            }
            if row.status != MatchStatus::VoteActive {
                return Err(AppError::NotInVoteWindow);
            }
            row.vote_window_expires_at.ok_or(AppError::NotInVoteWindow)
        })
        .await
    }

    /// `Vote(match_id, user_id, value)`.
    #[instrument(skip(self), fields(%match_id, %user_id))]
    pub async fn vote(
        &self,
        match_id: MatchId,
        user_id: Uuid,
        value: VoteValue,
    ) -> AppResult<VoteOutcome> {
        self.with_timeout(VoteResolver::record_vote(
            &self.db_pool,
            self.clock.as_ref(),
            &self.config,
            self.events.as_ref(),
            match_id,
            user_id,
            value,
        ))
        .await
    }

    /// `Disconnect(user_id)`: if the user is `waiting`, removes them from
    /// the queue and returns them to `idle`, a plain exit, no penalty.
    /// If they hold an open match (`matched` or `vote_window`), their
    /// vote is treated as missing (same outcome semantics as a timeout),
    /// their partner is advanced accordingly, and the disconnecting user
    /// serves a cooldown. A user already `idle` or `cooldown` is just
    /// marked offline.
    #[instrument(skip(self), fields(%user_id))]
    pub async fn disconnect(&self, user_id: Uuid) -> AppResult<()> {
        self.with_timeout(async {
            let now = self.clock.now();
            let mut tx = self.db_pool.begin().await?;

            let row = sqlx::query!(
                r#"SELECT state as "state: UserLifecycleState", match_id FROM user_state WHERE user_id = $1"#,
                user_id
            )
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or(AppError::UnknownUser)?;

            match row.state {
                UserLifecycleState::Waiting => {
                    StateMachine::validate(row.state, Cause::Disconnected, UserLifecycleState::Idle)?;
                    sqlx::query!("DELETE FROM queue WHERE user_id = $1", user_id)
                        .execute(tx.as_mut())
                        .await?;
                    sqlx::query!(
                        r#"
                        UPDATE user_state
                        SET state = 'idle', match_id = NULL, partner_id = NULL, waiting_since = NULL, fairness = 0
                        WHERE user_id = $1
                        "#,
                        user_id
                    )
                    .execute(tx.as_mut())
                    .await?;
                    sqlx::query!("UPDATE users SET online = false WHERE id = $1", user_id)
                        .execute(tx.as_mut())
                        .await?;
                    self.events
                        .publish(
                            &mut tx,
                            crate::models::EventKind::UserStateChanged {
                                user_id,
                                state: UserLifecycleState::Idle,
                                match_id: None,
                            },
                        )
                        .await?;
                }
                UserLifecycleState::Matched | UserLifecycleState::VoteWindow => {
                    StateMachine::validate(row.state, Cause::Disconnected, UserLifecycleState::Cooldown)?;
                    let match_id = row.match_id.ok_or(AppError::Integrity(
                        "matched/vote_window user_state missing match_id",
                    ))?;
                    VoteResolver::resolve_disconnect_vote(
                        &mut tx,
                        &self.config,
                        self.events.as_ref(),
                        match_id,
                        user_id,
                        now,
                    )
                    .await?;
                    self.cooldown_this_user(&mut tx, user_id, now).await?;
                }
                UserLifecycleState::VideoDate => {
                    StateMachine::validate(row.state, Cause::Disconnected, UserLifecycleState::Cooldown)?;
                    self.cooldown_this_user(&mut tx, user_id, now).await?;
                }
                UserLifecycleState::Idle | UserLifecycleState::Cooldown => {
                    sqlx::query!("UPDATE users SET online = false WHERE id = $1", user_id)
                        .execute(tx.as_mut())
                        .await?;
                }
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Shared tail of the disconnect-while-matched paths: moves the
    /// disconnecting user's own row to `cooldown` with the configured
    /// TTL and marks them offline.
    async fn cooldown_this_user(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> AppResult<()> {
        let cooldown_until = now + self.config.disconnect_cooldown;
        sqlx::query!(
            r#"
            UPDATE user_state
            SET state = 'cooldown', match_id = NULL, partner_id = NULL, waiting_since = NULL
            WHERE user_id = $1
            "#,
            user_id
        )
        .execute(tx.as_mut())
        .await?;

        sqlx::query!(
            "UPDATE users SET online = false, cooldown_until = $2 WHERE id = $1",
            user_id,
            cooldown_until
        )
        .execute(tx.as_mut())
        .await?;

        self.events
            .publish(
                tx,
                crate::models::EventKind::UserStateChanged {
                    user_id,
                    state: UserLifecycleState::Cooldown,
                    match_id: None,
                },
            )
            .await?;
        Ok(())
    }

    /// `GetMatchStatus(user_id)`.
    #[instrument(skip(self), fields(%user_id))]
    pub async fn get_match_status(&self, user_id: Uuid) -> AppResult<MatchStatusView> {
        self.with_timeout(async {
            let row = sqlx::query!(
                r#"
                SELECT state as "state: UserLifecycleState", match_id, partner_id
                FROM user_state WHERE user_id = $1
                "#,
                user_id
            )
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or(AppError::UnknownUser)?;

            let vote_window_expires_at = if let Some(match_id) = row.match_id {
                sqlx::query_scalar!(
                    "SELECT vote_window_expires_at FROM matches WHERE id = $1",
                    match_id
                )
                .fetch_optional(&self.db_pool)
                .await?
                .flatten()
            } else {
                None
            };

            Ok(MatchStatusView {
                state: row.state,
                match_id: row.match_id,
                partner_id: row.partner_id,
                vote_window_expires_at,
            })
        })
        .await
    }

    async fn with_timeout<F, T>(&self, fut: F) -> AppResult<T>
    where
        F: std::future::Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Busy),
        }
    }
}

async fn current_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
) -> AppResult<UserLifecycleState> {
    let row = sqlx::query!(
        r#"SELECT state as "state: UserLifecycleState" FROM user_state WHERE user_id = $1"#,
        user_id
    )
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(AppError::UnknownUser)?;
    Ok(row.state)
}

async fn fetch_user(db_pool: &PgPool, user_id: Uuid) -> AppResult<Option<crate::models::User>> {
    let row = sqlx::query!(
        r#"
        SELECT
            id, gender as "gender: crate::models::Gender", age, latitude, longitude,
            online, last_active, cooldown_until,
            min_age, max_age, max_distance,
            gender_pref as "gender_pref: crate::models::GenderPreference"
        FROM users WHERE id = $1
        "#,
        user_id
    )
    .fetch_optional(db_pool)
    .await?;

    Ok(row.map(|row| crate::models::User {
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
    }))
}
