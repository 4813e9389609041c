//! Monotonic wall clock for document timestamps.
//!
//! Wall time can stand still or step backwards (NTP corrections, VM
//! suspends). Every timestamp the store hands out is strictly greater than
//! the previous one, so `updatedAt` always moves forward.

use crate::Timestamp;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

/// The system clock, via chrono.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now_millis(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A clock that never repeats or goes backwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonotonicClock {
    last: Timestamp,
}

impl MonotonicClock {
    /// Create a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Resume from the highest timestamp already on disk.
    pub fn starting_after(last: Timestamp) -> Self {
        Self { last }
    }

    /// Issue the next timestamp given the current wall time.
    pub fn tick(&mut self, wall: Timestamp) -> Timestamp {
        self.last = wall.max(self.last + 1);
        self.last
    }

    /// Make sure later ticks are past `seen`.
    pub fn observe(&mut self, seen: Timestamp) {
        self.last = self.last.max(seen);
    }

    pub fn last(&self) -> Timestamp {
        self.last
    }
}
