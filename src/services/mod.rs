//! # Matching Services
//!
//! Core business logic for the matchmaking engine. Each service owns one
//! concern and is composed by [`crate::commands::Engine`] and
//! [`scheduler::Scheduler`].
//!
//! ## Available Services
//!
//! - **State machine** (`state_machine`) - sole authority over lifecycle transitions
//! - **Fairness** (`fairness`) - queue scoring and candidate ordering
//! - **Candidate finder** (`candidate_finder`) - tiered eligible-partner search
//! - **Pair creator** (`pair_creator`) - atomic two-user pairing protocol
//! - **Vote resolver** (`vote_resolver`) - vote recording and outcome resolution
//! - **Scheduler** (`scheduler`) - background reconciliation ticks
//! - **Locks** (`locks`) - advisory per-user locking
//! - **Events** (`events`) - domain event persistence and fan-out

pub mod candidate_finder;
pub mod events;
pub mod fairness;
pub mod locks;
pub mod pair_creator;
pub mod scheduler;
pub mod state_machine;
pub mod vote_resolver;
