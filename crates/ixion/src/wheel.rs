//! The bucket ring and the single-driver advancement loop.
//!
//! One logical driver owns advancement: per tick it sleeps to the tick
//! boundary, drains the due queue of the selected bucket, ages the rest
//! and re-inserts recurrences. Submissions and cancellations proceed
//! concurrently; the driver never holds shared state across a suspension
//! that would block them.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bucket::Bucket;
use crate::clock::{ceil_millis, MonotonicClock};
use crate::error::TimerError;
use crate::handle::Timeout;

const STATE_IDLE: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

pub(crate) struct Wheel {
    buckets: Vec<Bucket>,
    mask: u64,
    tick_ms: u64,
    max_parallel: usize,
    /// Current tick, read by submitters for the position formula.
    tick: AtomicU64,
    state: AtomicU8,
    clock: MonotonicClock,
}

impl Wheel {
    /// `bucket_count` must already be a power of two (the builder
    /// guarantees it).
    pub(crate) fn new(bucket_count: usize, tick_ms: u64, max_parallel: usize) -> Self {
        debug_assert!(bucket_count.is_power_of_two());
        let buckets = (0..bucket_count).map(|_| Bucket::new()).collect();
        Self {
            buckets,
            mask: (bucket_count - 1) as u64,
            tick_ms,
            max_parallel,
            tick: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
            clock: MonotonicClock::new(),
        }
    }

    pub(crate) fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub(crate) fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Compute round count and bucket slot for a handle and enqueue it.
    ///
    /// Shared by insertion and recurrence. A deadline that has already
    /// passed lands in the bucket the driver processes next, so a zero or
    /// elapsed delay fires on the next tick.
    pub(crate) fn place(&self, timeout: &Arc<Timeout>) {
        let tick = self.current_tick();
        let calc = timeout.deadline_ms() / self.tick_ms;
        let remaining = calc.saturating_sub(tick) / self.buckets.len() as u64;
        let index = (calc.max(tick) & self.mask) as usize;
        timeout.set_remaining_rounds(remaining);
        tracing::trace!(
            timeout_id = timeout.id(),
            bucket = index,
            remaining_rounds = remaining,
            "timeout placed"
        );
        self.buckets[index].add(Arc::clone(timeout));
    }

    /// Transition `Idle -> Started`. Returns `Ok(false)` when already
    /// started (a second start is a no-op) and `InvalidState` after
    /// shutdown.
    pub(crate) fn transition_started(&self) -> Result<bool, TimerError> {
        match self.state.compare_exchange(
            STATE_IDLE,
            STATE_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(true),
            Err(STATE_STARTED) => Ok(false),
            Err(_) => Err(TimerError::InvalidState(
                "timer is already shut down".to_string(),
            )),
        }
    }

    /// Transition to the terminal `Shutdown` state.
    pub(crate) fn shutdown(&self) {
        self.state.store(STATE_SHUTDOWN, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SHUTDOWN
    }

    /// The driver loop. Runs until the token fires or `shutdown` is
    /// observed at a tick boundary.
    pub(crate) async fn run(&self, token: CancellationToken) {
        let mut tick = self.current_tick();
        tracing::info!(
            buckets = self.buckets.len(),
            tick_ms = self.tick_ms,
            max_parallel = self.max_parallel,
            "timer driver started"
        );
        loop {
            let target_ms = (tick + 1) * self.tick_ms;
            if !self.sleep_until(target_ms, &token).await {
                break;
            }
            if self.is_shutdown() {
                break;
            }
            let bucket = &self.buckets[(tick & self.mask) as usize];
            let now_ms = self.clock.now_ms();
            tracing::trace!(tick, now_ms, "processing bucket");

            let recurrences = bucket.expire_due(now_ms, self.max_parallel, &token).await;
            for timeout in recurrences {
                self.reschedule(timeout);
            }
            bucket.age(&token);

            tick += 1;
            self.tick.store(tick, Ordering::Release);
        }
        tracing::info!(ticks = tick, "timer driver stopped");
    }

    /// Re-deadline a handle that still owes executions and hand it to its
    /// next bucket. The next execution is strictly after the current one
    /// because the bucket awaited it before returning the handle.
    fn reschedule(&self, timeout: Arc<Timeout>) {
        if timeout.is_canceled() {
            timeout.release();
            return;
        }
        timeout.advance_deadline();
        timeout.decrement_recurring();
        tracing::debug!(
            timeout_id = timeout.id(),
            deadline_ms = timeout.deadline_ms(),
            recurring_rounds = timeout.recurring_rounds(),
            "timeout rescheduled"
        );
        self.place(&timeout);
    }

    /// Cooperative sleep until elapsed time reaches `target_ms`, rounded
    /// up to whole milliseconds. Returns `false` when the token fired.
    async fn sleep_until(&self, target_ms: u64, token: &CancellationToken) -> bool {
        let target = Duration::from_millis(target_ms);
        loop {
            let now = self.clock.now();
            if now >= target {
                return true;
            }
            let wait = Duration::from_millis(ceil_millis(target - now).max(1));
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Gather every live entry left in the wheel, bucket order 0..N-1,
    /// pending queue before due queue within each bucket.
    pub(crate) fn drain_unprocessed(&self) -> Vec<Arc<Timeout>> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            bucket.drain_unprocessed(&mut out);
        }
        out
    }

    #[allow(dead_code)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
