//! # Tandem - Real-Time Speed-Dating Matchmaking Core
//!
//! A queue-based matching engine: users `Spin` into a queue, a background
//! scheduler pairs them under a fairness-weighted search, and a bounded
//! vote window decides whether the pair continues to a video date. There
//! is no transport layer in this crate ([`commands::Engine`] is the
//! entire external surface), meant to be driven directly by a server
//! process or embedded into one.
//!
//! ## Modules
//!
//! - [`commands`] - the Command API (`Spin`, `Vote`, `Disconnect`, ...)
//! - [`models`] - data model: users, queue entries, matches, votes, history
//! - [`services`] - the state machine, fairness engine, candidate finder,
//!   pair creator, vote resolver, scheduler, locks, and event publisher
//! - [`config`] - every tunable knob, with environment overrides
//! - [`clock`] - the time source abstraction, real or fake
//! - [`error`] - the unified error type and its retriability taxonomy

pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;

use crate::clock::Clock;
use crate::commands::Engine;
use crate::config::Config;
use crate::services::events::StoredEventPublisher;
use crate::services::locks::AdvisoryLocks;
use crate::services::scheduler::Scheduler;

/// Everything needed to run the matching core: the [`Engine`] for
/// handling commands and the [`Scheduler`] driving background ticks.
/// Both share the same lock table and event publisher so a pair created
/// by the scheduler is visible to a command issued moments later.
pub struct Core {
    pub engine: Engine,
    pub scheduler: Scheduler,
}

impl Core {
    pub fn new(db_pool: PgPool, clock: Arc<dyn Clock>, config: Config) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(AdvisoryLocks::new());
        let events = Arc::new(StoredEventPublisher::new());

        let engine = Engine::new(
            db_pool.clone(),
            Arc::clone(&clock),
            Arc::clone(&config),
            Arc::clone(&locks),
            Arc::clone(&events),
        );
        let scheduler = Scheduler::new(db_pool, clock, config, locks, events);

        Self { engine, scheduler }
    }

    /// Builds a production core backed by the system clock.
    pub fn production(db_pool: PgPool, config: Config) -> Self {
        Self::new(db_pool, Arc::new(clock::SystemClock), config)
    }

    /// Spawns the scheduler's background ticks and returns their join
    /// handles; the `Engine` half of the core can be used independently
    /// of this call.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.scheduler.run()
    }
}
