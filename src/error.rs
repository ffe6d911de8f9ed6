//! # Centralized Error Handling
//!
//! This module provides the unified error type used across the matchmaking
//! core. There is no HTTP layer in this crate to convert errors into
//! responses (the transport is an external collaborator). Instead every
//! error exposes an [`ErrorKind`] so callers (commands, the scheduler) can
//! decide whether a failure is worth retrying without matching on every
//! variant.

use thiserror::Error;

/// Coarse error taxonomy: preconditions never change state, transient
/// errors are safe to retry, integrity violations are either swallowed
/// races or bugs, and fatal errors abort the affected job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Transient,
    Integrity,
    Fatal,
}

/// Central application error type that encompasses all possible error
/// conditions raised by the matching core.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("user is already queued")]
    AlreadyQueued,

    #[error("user is already matched")]
    AlreadyMatched,

    #[error("user is in cooldown")]
    InCooldown,

    #[error("user is offline")]
    UserOffline,

    #[error("match is not in a vote window")]
    NotInVoteWindow,

    #[error("vote window has expired")]
    Expired,

    #[error("user is not a participant in this match")]
    NotParticipant,

    #[error("invalid vote value")]
    InvalidValue,

    #[error("match not found")]
    InvalidMatch,

    #[error("unknown user")]
    UnknownUser,

    #[error("operation could not acquire its locks or transaction in time")]
    Busy,

    #[error("unique-index violation on pair creation, another worker won the race")]
    RaceLost,

    #[error("internal invariant violated: {0}")]
    Integrity(&'static str),

    #[error("database error")]
    Db(#[from] sqlx::Error),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    /// Classifies this error per the design's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidTransition { .. }
            | AppError::AlreadyQueued
            | AppError::AlreadyMatched
            | AppError::InCooldown
            | AppError::UserOffline
            | AppError::NotInVoteWindow
            | AppError::NotParticipant
            | AppError::InvalidValue
            | AppError::InvalidMatch
            | AppError::UnknownUser => ErrorKind::Precondition,

            AppError::Busy | AppError::Expired => ErrorKind::Transient,

            AppError::RaceLost | AppError::Integrity(_) => ErrorKind::Integrity,

            AppError::Db(_) | AppError::Internal => ErrorKind::Fatal,
        }
    }

    /// True if the scheduler may silently let the next tick make progress
    /// instead of logging this as a bug.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

/// Convenience Result type alias that uses AppError as the error type.
pub type AppResult<T> = Result<T, AppError>;
