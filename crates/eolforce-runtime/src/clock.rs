//! [`TestClock`] – the time base of one test.
//!
//! Sample timestamps are monotonic nanoseconds since the clock's origin.
//! The wall-clock instant of the origin is captured at the same moment, so
//! `started_at + t_ns` is the wall time of a sample and every timestamp the
//! engine derives from the clock is ordered consistently.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TestClock {
    origin: Instant,
    started_at: DateTime<Utc>,
}

impl TestClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Wall time derived from the monotonic clock; never earlier than
    /// [`started_at`](Self::started_at).
    pub fn wall_now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.elapsed()).unwrap_or(TimeDelta::MAX);
        self.started_at
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
