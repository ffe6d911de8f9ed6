//! # Monotonic Time Source
//!
//! Every timeout in the matching core (vote window expiry, offline
//! eviction, wait-time fairness boosts) derives from a [`Clock`] rather
//! than calling `OffsetDateTime::now_utc()` directly, so integration tests
//! can advance time deterministically instead of sleeping real seconds.

use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

/// Source of the current time for the matching core.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// The production clock, backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A controllable clock for tests. Starts at construction time and only
/// moves forward when [`FakeClock::advance`] is called.
#[derive(Debug)]
pub struct FakeClock {
    unix_nanos: AtomicI64,
}

impl FakeClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { unix_nanos: AtomicI64::new((start.unix_timestamp_nanos() / 1_000) as i64) }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: std::time::Duration) {
        self.unix_nanos
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        let micros = self.unix_nanos.load(Ordering::SeqCst);
        OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000)
            .expect("fake clock produced an out-of-range timestamp")
    }
}
