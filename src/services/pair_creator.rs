//! # Pair Creator
//!
//! Atomically promotes two users from the queue to a `vote_active` match
//! under ordered advisory locks. Opening the vote window is step 6 of the
//! same transaction rather than a separate post-write trigger, removing a
//! whole class of race conditions.

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::AppResult;
use crate::models::{Match, MatchStatus, User};
use crate::services::candidate_finder::core_filters_ok;
use crate::services::events::EventPublisher;
use crate::services::locks::AdvisoryLocks;
use crate::services::state_machine::{Cause, StateMachine};

/// Tagged result so callers cannot misinterpret outcome branching (see
/// branching on an untyped payload).
#[derive(Debug)]
pub enum PairOutcome {
    Created(Match),
    /// Either advisory lock was contested; the caller should try again
    /// next tick.
    Busy,
    /// Locks were acquired but re-validation under lock failed, or the
    /// unique partial index rejected the insert because another worker
    /// won the race. Not an error.
    NoMatch,
}

pub struct PairCreator;

impl PairCreator {
    #[instrument(skip(db_pool, clock, locks, events), fields(%a, %b, tier))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_pair(
        db_pool: &PgPool,
        clock: &dyn Clock,
        config: &Config,
        locks: &AdvisoryLocks,
        events: &dyn EventPublisher,
        a: Uuid,
        b: Uuid,
        tier: u8,
    ) -> AppResult<PairOutcome> {
        if a == b {
            return Ok(PairOutcome::NoMatch);
        }

        let (lo, hi) = Match::canonical_order(a, b);

        // Step 2: ordered, non-blocking two-lock acquisition (P7).
        let Some((_lo_guard, _hi_guard)) = locks.try_lock_pair(lo, hi) else {
            return Ok(PairOutcome::Busy);
        };

        let now = clock.now();
        let mut tx = db_pool.begin().await?;

        // Step 3: double-checked re-validation with locks held.
        let Some((user_lo, user_hi)) = fetch_pair(&mut tx, lo, hi).await? else {
            return Ok(PairOutcome::NoMatch);
        };

        if !both_still_eligible(&user_lo, &user_hi, tier, now) {
            return Ok(PairOutcome::NoMatch);
        }

        if is_never_pair(&mut tx, lo, hi).await? {
            return Ok(PairOutcome::NoMatch);
        }

        if tier == 0 && is_recent_history(&mut tx, lo, hi, now - config.history_cooldown).await? {
            return Ok(PairOutcome::NoMatch);
        }

        if has_active_match(&mut tx, lo).await? || has_active_match(&mut tx, hi).await? {
            return Ok(PairOutcome::NoMatch);
        }

        // Step 4: insert the match as `paired`. The partial unique index
        // is the last-line guarantee; a conflict here means another
        // worker already won this pair and we lose gracefully.
        let match_id = Uuid::new_v4();
        let insert_result = sqlx::query!(
            r#"
            INSERT INTO matches (id, user1_id, user2_id, status, created_at)
            VALUES ($1, $2, $3, 'paired', $4)
            ON CONFLICT DO NOTHING
            "#,
            match_id,
            lo,
            hi,
            now
        )
        .execute(tx.as_mut())
        .await?;

        if insert_result.rows_affected() == 0 {
            warn!(%lo, %hi, "pair creation lost the race to another worker");
            tx.rollback().await?;
            return Ok(PairOutcome::NoMatch);
        }

        // Step 5: remove both from the queue, transition to matched.
        sqlx::query!("DELETE FROM queue WHERE user_id IN ($1, $2)", lo, hi)
            .execute(tx.as_mut())
            .await?;

        for user_id in [lo, hi] {
            StateMachine::validate(
                current_state(&mut tx, user_id).await?,
                Cause::PairCreated,
                crate::models::UserLifecycleState::Matched,
            )?;
            // Fairness resets to 0 on queue exit (§4.2); a respin after
            // this match's outcome starts fresh plus whatever boost the
            // outcome itself grants, rather than compounding indefinitely
            // across pairing cycles.
            sqlx::query!(
                r#"
                UPDATE user_state
                SET state = 'matched', match_id = $2, partner_id = $3, last_active = $4, fairness = 0
                WHERE user_id = $1
                "#,
                user_id,
                match_id,
                if user_id == lo { hi } else { lo },
                now
            )
            .execute(tx.as_mut())
            .await?;
        }

        // Step 6: immediately open the vote window, no separate trigger,
        // no separate Acknowledge step required.
        let expires_at = now + config.vote_window;
        sqlx::query!(
            r#"
            UPDATE matches
            SET status = 'vote_active', vote_window_started_at = $2, vote_window_expires_at = $3
            WHERE id = $1
            "#,
            match_id,
            now,
            expires_at
        )
        .execute(tx.as_mut())
        .await?;

        for user_id in [lo, hi] {
            sqlx::query!(
                "UPDATE user_state SET state = 'vote_window' WHERE user_id = $1",
                user_id
            )
            .execute(tx.as_mut())
            .await?;

            sqlx::query!(
                r#"
                INSERT INTO state_transitions (user_id, from_state, to_state, cause, created_at)
                VALUES ($1, 'matched', 'vote_window', $2, $3)
                "#,
                user_id,
                Cause::VoteWindowAutoOpened.as_str(),
                now
            )
            .execute(tx.as_mut())
            .await?;
        }

        // Step 7: emit MatchCreated.
        events
            .publish(
                &mut tx,
                crate::models::EventKind::MatchCreated {
                    match_id,
                    user1_id: lo,
                    user2_id: hi,
                    vote_window_expires_at: expires_at,
                },
            )
            .await?;

        tx.commit().await?;

        let created = Match {
            id: match_id,
            user1_id: lo,
            user2_id: hi,
            status: MatchStatus::VoteActive,
            outcome: None,
            created_at: now,
            vote_window_started_at: Some(now),
            vote_window_expires_at: Some(expires_at),
        };

        info!(%match_id, "pair created and vote window opened");
        Ok(PairOutcome::Created(created))
    }
}

fn both_still_eligible(a: &User, b: &User, tier: u8, now: OffsetDateTime) -> bool {
    let recently_active = |u: &User| (now - u.last_active) <= time::Duration::seconds(10);
    a.online
        && b.online
        && recently_active(a)
        && recently_active(b)
        && eligible_pair(a, b, tier, now)
}

fn eligible_pair(a: &User, b: &User, tier: u8, now: OffsetDateTime) -> bool {
    // Re-derives the same hard filters the candidate finder applied, so
    // a user who changed preferences or went stale between search and
    // lock acquisition can't slip through.
    core_filters_ok(a, b, tier, now)
}

async fn fetch_pair(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    lo: Uuid,
    hi: Uuid,
) -> AppResult<Option<(User, User)>> {
    let rows = sqlx::query!(
        r#"
        SELECT
            u.id, u.gender as "gender: crate::models::Gender", u.age, u.latitude, u.longitude,
            u.online, u.last_active, u.cooldown_until,
            u.min_age, u.max_age, u.max_distance,
            u.gender_pref as "gender_pref: crate::models::GenderPreference"
        FROM users u
        JOIN queue q ON q.user_id = u.id
        JOIN user_state us ON us.user_id = u.id AND us.state = 'waiting'
        WHERE u.id IN ($1, $2)
        "#,
        lo,
        hi
    )
    .fetch_all(tx.as_mut())
    .await?;

    if rows.len() != 2 {
        return Ok(None);
    }

    let mut users: Vec<User> = rows
        .into_iter()
        .map(|row| User {
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
        })
        .collect();

    users.sort_by_key(|u| u.id);
    let b = users.pop().unwrap();
    let a = users.pop().unwrap();
    Ok(Some((a, b)))
}

async fn is_never_pair(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    lo: Uuid,
    hi: Uuid,
) -> AppResult<bool> {
    let row = sqlx::query!(
        r#"SELECT 1 as "exists!" FROM never_pair WHERE least_id = $1 AND greatest_id = $2"#,
        lo,
        hi
    )
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row.is_some())
}

async fn is_recent_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    lo: Uuid,
    hi: Uuid,
    since: OffsetDateTime,
) -> AppResult<bool> {
    let row = sqlx::query!(
        r#"
        SELECT 1 as "exists!" FROM pair_history
        WHERE user1_id = $1 AND user2_id = $2 AND last_matched_at > $3
        "#,
        lo,
        hi,
        since
    )
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row.is_some())
}

async fn has_active_match(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, user_id: Uuid) -> AppResult<bool> {
    let row = sqlx::query!(
        r#"
        SELECT 1 as "exists!" FROM matches
        WHERE (user1_id = $1 OR user2_id = $1) AND status != 'completed'
        LIMIT 1
        "#,
        user_id
    )
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row.is_some())
}

async fn current_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
) -> AppResult<crate::models::UserLifecycleState> {
    let row = sqlx::query!(
        r#"SELECT state as "state: crate::models::UserLifecycleState" FROM user_state WHERE user_id = $1"#,
        user_id
    )
    .fetch_one(tx.as_mut())
    .await?;
    Ok(row.state)
}
