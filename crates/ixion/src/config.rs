//! Timer configuration and builder.
//!
//! All options are validated once at `build()`; a constructed timer never
//! surfaces a configuration error at runtime.

use std::time::Duration;

use crate::clock::ceil_millis;
use crate::error::TimerError;
use crate::timer::WheelTimer;

/// Hard cap on the bucket count after power-of-two rounding.
pub const MAX_BUCKET_COUNT: usize = 1 << 30;
/// Hard cap on the pending-timeout ceiling.
pub const MAX_PENDING_TIMEOUTS: u64 = 1_000_000;
/// Hard cap on per-bucket expiration fan-out.
pub const MAX_PARALLEL_EXPIRATIONS: usize = 128;
/// Maximum total wheel span (tick interval times bucket count).
pub const MAX_WHEEL_SPAN: Duration = Duration::from_secs(60);

/// Immutable timer configuration.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Duration of one driver tick. Whole milliseconds, at least one.
    pub tick_interval: Duration,
    /// Number of ring slots; rounded up to the next power of two.
    pub bucket_count: usize,
    /// Admission ceiling; zero means unlimited.
    pub max_pending_timeouts: u64,
    /// Fan-out width when dispatching one bucket's due tasks.
    pub max_parallel_expirations: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            bucket_count: 512,
            max_pending_timeouts: 0,
            max_parallel_expirations: num_cpus::get().min(MAX_PARALLEL_EXPIRATIONS),
        }
    }
}

impl TimerConfig {
    /// Validate and normalize, rounding the bucket count up to a power of
    /// two. Errors here are the only configuration errors the timer ever
    /// produces.
    pub(crate) fn validated(mut self) -> Result<Self, TimerError> {
        if self.tick_interval < Duration::from_millis(1) {
            return Err(TimerError::InvalidConfiguration(
                "tick_interval must be at least 1ms".to_string(),
            ));
        }
        if self.tick_interval.subsec_nanos() % 1_000_000 != 0 {
            return Err(TimerError::InvalidConfiguration(
                "tick_interval must be a whole number of milliseconds".to_string(),
            ));
        }
        if self.bucket_count == 0 {
            return Err(TimerError::InvalidConfiguration(
                "bucket_count must be positive".to_string(),
            ));
        }
        self.bucket_count = self
            .bucket_count
            .next_power_of_two()
            .min(MAX_BUCKET_COUNT);
        if self.max_pending_timeouts > MAX_PENDING_TIMEOUTS {
            return Err(TimerError::InvalidConfiguration(format!(
                "max_pending_timeouts must not exceed {MAX_PENDING_TIMEOUTS}"
            )));
        }
        if self.max_parallel_expirations == 0 {
            return Err(TimerError::InvalidConfiguration(
                "max_parallel_expirations must be positive".to_string(),
            ));
        }
        if self.max_parallel_expirations > MAX_PARALLEL_EXPIRATIONS {
            return Err(TimerError::InvalidConfiguration(format!(
                "max_parallel_expirations must not exceed {MAX_PARALLEL_EXPIRATIONS}"
            )));
        }
        let span_ms = ceil_millis(self.tick_interval) * self.bucket_count as u64;
        if span_ms > MAX_WHEEL_SPAN.as_millis() as u64 {
            return Err(TimerError::InvalidConfiguration(format!(
                "wheel span of {span_ms}ms exceeds the {}s maximum",
                MAX_WHEEL_SPAN.as_secs()
            )));
        }
        Ok(self)
    }

    pub(crate) fn tick_ms(&self) -> u64 {
        ceil_millis(self.tick_interval)
    }
}

/// Builder for [`WheelTimer`].
#[derive(Debug, Clone, Default)]
pub struct TimerBuilder {
    config: TimerConfig,
}

impl TimerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of one driver tick (default 100ms).
    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.config.tick_interval = tick_interval;
        self
    }

    /// Number of ring slots (default 512); silently rounded up to the
    /// next power of two.
    pub fn bucket_count(mut self, bucket_count: usize) -> Self {
        self.config.bucket_count = bucket_count;
        self
    }

    /// Admission ceiling (default unlimited).
    pub fn max_pending_timeouts(mut self, limit: u64) -> Self {
        self.config.max_pending_timeouts = limit;
        self
    }

    /// Fan-out width per bucket per tick (default: available CPUs).
    pub fn max_parallel_expirations(mut self, width: usize) -> Self {
        self.config.max_parallel_expirations = width;
        self
    }

    /// Validate the options and construct the timer.
    pub fn build(self) -> Result<WheelTimer, TimerError> {
        let config = self.config.validated()?;
        Ok(WheelTimer::with_config(config))
    }
}
