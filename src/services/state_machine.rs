//! # State Machine
//!
//! Sole authority over `UserState.state` transitions.
//! Every mutation of a user's lifecycle state anywhere in this crate goes
//! through [`StateMachine::transition`] first, so illegal transitions are
//! caught in one place rather than scattered across call sites.

use crate::error::AppError;
use crate::models::UserLifecycleState as S;

/// The event that is driving a state transition. Kept distinct from
/// [`S`] (the state itself) so the event log can record *why* a
/// transition happened, not just what it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Spin,
    PairCreated,
    BothAcknowledged,
    VoteWindowAutoOpened,
    OutcomeBothYes,
    OutcomeIdleIdle,
    OutcomeIdleParticipant,
    OutcomeRespin,
    DateEnded,
    Disconnected,
    Evicted,
    CooldownElapsed,
}

impl Cause {
    /// Lowercase-snake-case name stored in `state_transitions.cause` for
    /// audit/debugging queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Spin => "spin",
            Cause::PairCreated => "pair_created",
            Cause::BothAcknowledged => "both_acknowledged",
            Cause::VoteWindowAutoOpened => "vote_window_auto_opened",
            Cause::OutcomeBothYes => "outcome_both_yes",
            Cause::OutcomeIdleIdle => "outcome_idle_idle",
            Cause::OutcomeIdleParticipant => "outcome_idle_participant",
            Cause::OutcomeRespin => "outcome_respin",
            Cause::DateEnded => "date_ended",
            Cause::Disconnected => "disconnected",
            Cause::Evicted => "evicted",
            Cause::CooldownElapsed => "cooldown_elapsed",
        }
    }
}

pub struct StateMachine;

impl StateMachine {
    /// Validates and computes the next state for `current` given `cause`.
    /// Returns [`AppError::InvalidTransition`] for anything not in the
    /// table documented alongside the states below.
    pub fn transition(current: S, cause: Cause) -> Result<S, AppError> {
        use Cause::*;

        let next = match (current, cause) {
            (S::Idle, Spin) => S::Waiting,
            (S::Waiting, PairCreated) => S::Matched,
            (S::Matched, BothAcknowledged) | (S::Matched, VoteWindowAutoOpened) => S::VoteWindow,
            (S::VoteWindow, OutcomeBothYes) => S::VideoDate,
            (S::VoteWindow, OutcomeIdleIdle) | (S::VoteWindow, OutcomeIdleParticipant) => S::Idle,
            (S::VoteWindow, OutcomeRespin) => S::Waiting,
            (S::VideoDate, DateEnded) => S::Idle,
            // Disconnecting out of the queue (no match held yet) is a
            // plain exit, not a penalty: back to idle, no cooldown.
            (S::Waiting, Disconnected) => S::Idle,
            // Disconnecting while holding a match (including the time
            // the vote window was active or the date already started)
            // is the only path into cooldown.
            (S::Matched, Disconnected) | (S::VoteWindow, Disconnected) | (S::VideoDate, Disconnected) => {
                S::Cooldown
            }
            (S::Waiting, Evicted) => S::Idle,
            (S::Cooldown, CooldownElapsed) => S::Idle,
            _ => {
                return Err(AppError::InvalidTransition {
                    from: state_name(current),
                    to: "n/a",
                });
            }
        };

        Ok(next)
    }

    /// Convenience wrapper that also validates the transition is legal
    /// before returning it, for call sites that already know the
    /// destination state and just need confirmation it's reachable.
    pub fn validate(current: S, cause: Cause, expected_next: S) -> Result<(), AppError> {
        let next = Self::transition(current, cause)?;
        if next != expected_next {
            return Err(AppError::InvalidTransition {
                from: state_name(current),
                to: state_name(expected_next),
            });
        }
        Ok(())
    }
}

fn state_name(state: S) -> &'static str {
    match state {
        S::Idle => "idle",
        S::Waiting => "waiting",
        S::Matched => "matched",
        S::VoteWindow => "vote_window",
        S::VideoDate => "video_date",
        S::Cooldown => "cooldown",
    }
}
