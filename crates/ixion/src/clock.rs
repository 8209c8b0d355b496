//! Monotonic time source for the wheel.
//!
//! Every deadline, tick target and sleep in this crate is expressed as an
//! elapsed [`Duration`] from one process-wide reference captured when the
//! timer is built. `Instant` never regresses, so wall-clock steps (NTP
//! adjustments, manual clock changes) cannot move a scheduled timeout.

use std::time::{Duration, Instant};

/// Monotonic clock anchored at timer construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Create a clock whose reference point is the current instant.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time since the clock reference.
    pub fn now(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed whole milliseconds since the clock reference, truncated.
    pub fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }

    /// Absolute deadline (in clock coordinates) for a delay starting now.
    pub fn deadline_from(&self, delay: Duration) -> Duration {
        self.now() + delay
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Round a duration up to the next whole millisecond.
///
/// Deadlines and driver sleeps are millisecond-aligned; rounding up keeps
/// the no-early-firing guarantee.
pub fn ceil_millis(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    if duration.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}
