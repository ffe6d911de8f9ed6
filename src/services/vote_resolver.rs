//! # Vote Resolver
//!
//! Records votes, detects completion, applies the outcome policy, and
//! updates downstream state. `record_vote` handles the
//! client-submitted path; `resolve_expired` is the reconciler that treats
//! a missing vote as idle once the window has passed.

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Match, MatchId, MatchStatus, Outcome, UserLifecycleState, VoteValue};
use crate::services::events::EventPublisher;
use crate::services::fairness::FairnessEngine;
use crate::services::state_machine::{Cause, StateMachine};

/// Tagged outcome of a vote submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Only one vote exists so far; the match is still open.
    Waiting,
    /// Both votes are in; the match completed with this outcome.
    Completed(Outcome),
}

pub struct VoteResolver;

impl VoteResolver {
    #[instrument(skip(db_pool, clock, events), fields(%match_id, %user_id))]
    pub async fn record_vote(
        db_pool: &PgPool,
        clock: &dyn Clock,
        config: &Config,
        events: &dyn EventPublisher,
        match_id: MatchId,
        user_id: Uuid,
        value: VoteValue,
    ) -> AppResult<VoteOutcome> {
        let now = clock.now();
        let mut tx = db_pool.begin().await?;

        // Step 1: load FOR UPDATE, reject if not vote_active or expired.
        let m = sqlx::query_as!(
            Match,
            r#"
            SELECT id, user1_id, user2_id,
                   status as "status: MatchStatus", outcome as "outcome: Outcome",
                   created_at, vote_window_started_at, vote_window_expires_at
            FROM matches WHERE id = $1 FOR UPDATE
            "#,
            match_id
        )
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(AppError::InvalidMatch)?;

        if m.status != MatchStatus::VoteActive {
            return Err(AppError::NotInVoteWindow);
        }

        let expires_at = m.vote_window_expires_at.ok_or(AppError::NotInVoteWindow)?;
        if now > expires_at {
            return Err(AppError::Expired);
        }

        // Step 2: participant check.
        if !m.has_participant(user_id) {
            return Err(AppError::NotParticipant);
        }

        // Step 3: upsert (second attempt by the same user overwrites).
        sqlx::query!(
            r#"
            INSERT INTO votes (match_id, user_id, value, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (match_id, user_id) DO UPDATE SET value = EXCLUDED.value
            "#,
            match_id,
            user_id,
            value as VoteValue,
            now
        )
        .execute(tx.as_mut())
        .await?;

        events
            .publish(
                &mut tx,
                crate::models::EventKind::VoteRecorded { match_id, user_id, value },
            )
            .await?;

        // Step 4: read both votes.
        let votes = sqlx::query!(
            r#"SELECT user_id, value as "value: VoteValue" FROM votes WHERE match_id = $1"#,
            match_id
        )
        .fetch_all(tx.as_mut())
        .await?;

        if votes.len() < 2 {
            tx.commit().await?;
            return Ok(VoteOutcome::Waiting);
        }

        let u1_vote = votes.iter().find(|v| v.user_id == m.user1_id).map(|v| v.value);
        let u2_vote = votes.iter().find(|v| v.user_id == m.user2_id).map(|v| v.value);
        let (Some(u1_vote), Some(u2_vote)) = (u1_vote, u2_vote) else {
            tx.commit().await?;
            return Ok(VoteOutcome::Waiting);
        };

        let outcome = outcome_for(u1_vote, u2_vote);

        complete_match(
            &mut tx,
            config,
            events,
            &m,
            outcome,
            Some(u1_vote),
            Some(u2_vote),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(%match_id, ?outcome, "match completed via vote resolution");
        Ok(VoteOutcome::Completed(outcome))
    }

    /// Reconciler: resolves every match whose vote window has expired,
    /// treating missing votes as idle.
    /// Returns the number of matches resolved, batched to `limit`.
    #[instrument(skip(db_pool, clock, events))]
    pub async fn resolve_expired(
        db_pool: &PgPool,
        clock: &dyn Clock,
        config: &Config,
        events: &dyn EventPublisher,
        limit: i64,
    ) -> AppResult<usize> {
        let now = clock.now();

        let expired_ids = sqlx::query!(
            r#"
            SELECT id FROM matches
            WHERE status = 'vote_active' AND vote_window_expires_at < $1
            ORDER BY vote_window_expires_at ASC
            LIMIT $2
            "#,
            now,
            limit
        )
        .fetch_all(db_pool)
        .await?
        .into_iter()
        .map(|row| row.id);

        let mut resolved = 0;
        for match_id in expired_ids {
            if Self::resolve_one_expired(db_pool, clock, config, events, match_id)
                .await?
                .is_some()
            {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Resolves a match when one participant disconnects while it is
    /// still open (`paired` or `vote_active`): the disconnecting user's
    /// vote is treated as missing, exactly like a timeout, and the
    /// partner's next state follows the same outcome table. The
    /// disconnecting user's own landing state is not decided here. A
    /// plain idle timeout sends a non-respondent to `idle`, but a
    /// disconnect explicitly lands them in `cooldown` instead, which the
    /// caller applies alongside the TTL.
    pub async fn resolve_disconnect_vote(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        config: &Config,
        events: &dyn EventPublisher,
        match_id: MatchId,
        disconnecting_user_id: Uuid,
        now: OffsetDateTime,
    ) -> AppResult<Outcome> {
        let m = sqlx::query_as!(
            Match,
            r#"
            SELECT id, user1_id, user2_id,
                   status as "status: MatchStatus", outcome as "outcome: Outcome",
                   created_at, vote_window_started_at, vote_window_expires_at
            FROM matches WHERE id = $1 AND status != 'completed' FOR UPDATE
            "#,
            match_id
        )
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(AppError::InvalidMatch)?;

        let partner_id = m.other(disconnecting_user_id).ok_or(AppError::NotParticipant)?;

        let votes = sqlx::query!(
            r#"SELECT user_id, value as "value: VoteValue" FROM votes WHERE match_id = $1"#,
            match_id
        )
        .fetch_all(tx.as_mut())
        .await?;
        let partner_vote = votes.iter().find(|v| v.user_id == partner_id).map(|v| v.value);

        let outcome = if disconnecting_user_id == m.user1_id {
            idle_outcome_for(None, partner_vote)
        } else {
            idle_outcome_for(partner_vote, None)
        };

        sqlx::query!(
            r#"
            UPDATE matches
            SET status = 'completed', outcome = $2,
                vote_window_started_at = NULL, vote_window_expires_at = NULL
            WHERE id = $1
            "#,
            m.id,
            outcome as Outcome
        )
        .execute(tx.as_mut())
        .await?;

        let (partner_next, partner_boost) = next_state_for_voter(config, partner_vote, None);
        apply_transition(tx, partner_id, partner_next, partner_boost, now).await?;

        let (lo, hi) = Match::canonical_order(m.user1_id, m.user2_id);
        sqlx::query!(
            r#"
            INSERT INTO pair_history (user1_id, user2_id, last_matched_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user1_id, user2_id) DO UPDATE SET last_matched_at = EXCLUDED.last_matched_at
            "#,
            lo,
            hi,
            now
        )
        .execute(tx.as_mut())
        .await?;

        events
            .publish(tx, crate::models::EventKind::MatchCompleted { match_id: m.id, outcome })
            .await?;

        Ok(outcome)
    }

    async fn resolve_one_expired(
        db_pool: &PgPool,
        clock: &dyn Clock,
        config: &Config,
        events: &dyn EventPublisher,
        match_id: MatchId,
    ) -> AppResult<Option<Outcome>> {
        let now = clock.now();
        let mut tx = db_pool.begin().await?;

        let Some(m) = sqlx::query_as!(
            Match,
            r#"
            SELECT id, user1_id, user2_id,
                   status as "status: MatchStatus", outcome as "outcome: Outcome",
                   created_at, vote_window_started_at, vote_window_expires_at
            FROM matches WHERE id = $1 AND status = 'vote_active' FOR UPDATE
            "#,
            match_id
        )
        .fetch_optional(tx.as_mut())
        .await?
        else {
            return Ok(None);
        };

        let Some(expires_at) = m.vote_window_expires_at else {
            return Ok(None);
        };
        if now <= expires_at {
            return Ok(None);
        }

        let votes = sqlx::query!(
            r#"SELECT user_id, value as "value: VoteValue" FROM votes WHERE match_id = $1"#,
            match_id
        )
        .fetch_all(tx.as_mut())
        .await?;

        let u1_vote = votes.iter().find(|v| v.user_id == m.user1_id).map(|v| v.value);
        let u2_vote = votes.iter().find(|v| v.user_id == m.user2_id).map(|v| v.value);

        let outcome = idle_outcome_for(u1_vote, u2_vote);

        complete_match(&mut tx, config, events, &m, outcome, u1_vote, u2_vote, now).await?;
        tx.commit().await?;

        Ok(Some(outcome))
    }
}

/// Outcome table for `RecordVote`.
fn outcome_for(u1: VoteValue, u2: VoteValue) -> Outcome {
    match (u1, u2) {
        (VoteValue::Yes, VoteValue::Yes) => Outcome::BothYes,
        (VoteValue::Yes, VoteValue::Pass) | (VoteValue::Pass, VoteValue::Yes) => Outcome::YesPass,
        (VoteValue::Pass, VoteValue::Pass) => Outcome::PassPass,
    }
}

/// Outcome table for `ResolveExpired`.
/// `present`/`missing` map to whichever of u1/u2 actually voted.
fn idle_outcome_for(u1: Option<VoteValue>, u2: Option<VoteValue>) -> Outcome {
    match (u1, u2) {
        (Some(VoteValue::Yes), None) | (None, Some(VoteValue::Yes)) => Outcome::YesIdle,
        (Some(VoteValue::Pass), None) | (None, Some(VoteValue::Pass)) => Outcome::PassIdle,
        (None, None) => Outcome::IdleIdle,
        // Both present but we got here via resolve_expired: treat as the
        // normal mutual outcome rather than double-counting as idle.
        (Some(a), Some(b)) => outcome_for(a, b),
    }
}

/// Shared completion path for both `record_vote` and `resolve_expired`:
/// marks the match completed, applies the per-user state transitions,
/// records pairing history, seeds `never_pair` on mutual yes, and emits
/// `MatchCompleted`.
#[allow(clippy::too_many_arguments)]
async fn complete_match(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config: &Config,
    events: &dyn EventPublisher,
    m: &Match,
    outcome: Outcome,
    u1_vote: Option<VoteValue>,
    u2_vote: Option<VoteValue>,
    now: OffsetDateTime,
) -> AppResult<()> {
    sqlx::query!(
        r#"
        UPDATE matches
        SET status = 'completed', outcome = $2,
            vote_window_started_at = NULL, vote_window_expires_at = NULL
        WHERE id = $1
        "#,
        m.id,
        outcome as Outcome
    )
    .execute(tx.as_mut())
    .await?;

    // Derived per-voter, not from the symmetric `outcome`: `outcome` alone
    // can't tell which participant actually said yes (e.g. `YesPass`
    // collapses both orderings), but the next state and fairness boost
    // are specific to who voted what.
    let (next_u1, boost_u1) = next_state_for_voter(config, u1_vote, u2_vote);
    let (next_u2, boost_u2) = next_state_for_voter(config, u2_vote, u1_vote);

    apply_transition(tx, m.user1_id, next_u1, boost_u1, now).await?;
    apply_transition(tx, m.user2_id, next_u2, boost_u2, now).await?;

    let (lo, hi) = Match::canonical_order(m.user1_id, m.user2_id);
    sqlx::query!(
        r#"
        INSERT INTO pair_history (user1_id, user2_id, last_matched_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user1_id, user2_id) DO UPDATE SET last_matched_at = EXCLUDED.last_matched_at
        "#,
        lo,
        hi,
        now
    )
    .execute(tx.as_mut())
    .await?;

    if outcome.is_mutual_yes() {
        sqlx::query!(
            r#"
            INSERT INTO never_pair (least_id, greatest_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
            lo,
            hi
        )
        .execute(tx.as_mut())
        .await?;
    }

    events
        .publish(tx, crate::models::EventKind::MatchCompleted { match_id: m.id, outcome })
        .await?;

    Ok(())
}

/// Resolves one participant's next state and fairness boost from their
/// own vote and their partner's.
/// A `yes` voter always returns to (or stays towards) an active search
/// with the respin boost; a non-respondent always lands in `idle` and
/// must re-spin manually.
fn next_state_for_voter(
    config: &Config,
    own_vote: Option<VoteValue>,
    other_vote: Option<VoteValue>,
) -> (UserLifecycleState, i32) {
    use UserLifecycleState::*;
    use VoteValue::*;

    match (own_vote, other_vote) {
        (Some(Yes), Some(Yes)) => (VideoDate, 0),
        (Some(Yes), _) => (Waiting, FairnessEngine::respin_boost(config)),
        (Some(Pass), _) => (Waiting, 0),
        (None, _) => (Idle, 0),
    }
}

async fn apply_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    next_state: UserLifecycleState,
    fairness_boost: i32,
    now: OffsetDateTime,
) -> AppResult<()> {
    let cause = match next_state {
        UserLifecycleState::VideoDate => Cause::OutcomeBothYes,
        UserLifecycleState::Idle => Cause::OutcomeIdleParticipant,
        UserLifecycleState::Waiting => Cause::OutcomeRespin,
        _ => unreachable!("vote outcomes only ever resolve to waiting, idle, or video_date"),
    };

    let row = sqlx::query!(
        r#"SELECT state as "state: UserLifecycleState" FROM user_state WHERE user_id = $1"#,
        user_id
    )
    .fetch_one(tx.as_mut())
    .await?;
    let from_state = row.state;
    StateMachine::validate(from_state, cause, next_state)?;

    sqlx::query!(
        r#"
        INSERT INTO state_transitions (user_id, from_state, to_state, cause, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
        user_id,
        from_state as UserLifecycleState,
        next_state as UserLifecycleState,
        cause.as_str(),
        now
    )
    .execute(tx.as_mut())
    .await?;

    match next_state {
        UserLifecycleState::Waiting => {
            sqlx::query!(
                r#"
                UPDATE user_state
                SET state = 'waiting', match_id = NULL, partner_id = NULL,
                    waiting_since = $2, fairness = fairness + $3, last_active = $2
                WHERE user_id = $1
                "#,
                user_id,
                now,
                fairness_boost
            )
            .execute(tx.as_mut())
            .await?;

            sqlx::query!(
                r#"
                INSERT INTO queue (user_id, joined_at, fairness, wait_boost_applied, preference_stage)
                SELECT $1, $2, fairness, 0, 0 FROM user_state WHERE user_id = $1
                ON CONFLICT (user_id) DO UPDATE SET joined_at = EXCLUDED.joined_at
                "#,
                user_id,
                now
            )
            .execute(tx.as_mut())
            .await?;
        }
        UserLifecycleState::Idle => {
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
        }
        UserLifecycleState::VideoDate => {
            sqlx::query!(
                "UPDATE user_state SET state = 'video_date' WHERE user_id = $1",
                user_id
            )
            .execute(tx.as_mut())
            .await?;
        }
        _ => unreachable!("vote outcomes only ever resolve to waiting, idle, or video_date"),
    }

    Ok(())
}
