//! Timeout handles: identity, deadline, rounds and lifecycle state.
//!
//! One `Timeout` exists per submitted task. Mutable fields are plain
//! atomics with one-way transition rules: a handle moves from pending to
//! exactly one of canceled or expired, and once terminal only observation
//! is allowed. Cancellation is a state flip; physical removal from the
//! wheel happens lazily the next time the owning bucket visits the entry.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::task::{TaskOutcome, TimerTask};
use crate::timer::TimerShared;

const STATE_PENDING: u8 = 0;
const STATE_CANCELED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

/// Handle to one scheduled timeout.
///
/// Returned by [`WheelTimer::submit`](crate::WheelTimer::submit); shared
/// between the submitter, the wheel and the running task.
pub struct Timeout {
    id: u64,
    task: Arc<dyn TimerTask>,
    /// Deadline in whole milliseconds since the clock reference.
    deadline_ms: AtomicU64,
    /// Original requested delay, retained for recurrences.
    interval_ms: u64,
    /// Full wheel revolutions still owed; decremented once per bucket visit.
    remaining_rounds: AtomicU64,
    /// Additional executions scheduled after the first.
    recurring_rounds: AtomicU32,
    state: AtomicU8,
    /// Guards the pending-counter decrement: exactly once per handle.
    released: AtomicBool,
    shared: Arc<TimerShared>,
}

impl Timeout {
    pub(crate) fn new(
        id: u64,
        task: Arc<dyn TimerTask>,
        deadline_ms: u64,
        interval_ms: u64,
        recurring_rounds: u32,
        shared: Arc<TimerShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            task,
            deadline_ms: AtomicU64::new(deadline_ms),
            interval_ms,
            remaining_rounds: AtomicU64::new(0),
            recurring_rounds: AtomicU32::new(recurring_rounds),
            state: AtomicU8::new(STATE_PENDING),
            released: AtomicBool::new(false),
            shared,
        })
    }

    /// Handle not owned by any timer; unit-test construction only.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, task: Arc<dyn TimerTask>) -> Arc<Self> {
        Self::new(id, task, 0, 0, 0, Arc::new(TimerShared::new(0)))
    }

    /// Unique id, strictly increasing in submission order.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The user task this timeout dispatches.
    pub fn task(&self) -> &Arc<dyn TimerTask> {
        &self.task
    }

    /// Atomically cancel the timeout.
    ///
    /// Returns `true` on the first successful transition, `false` if the
    /// handle is already canceled or expired. Has no effect on a task that
    /// is already running.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_PENDING,
                STATE_CANCELED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether the timeout has fired for the last time.
    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_EXPIRED
    }

    /// Whether the timeout was canceled before it could fire.
    pub fn is_canceled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELED
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PENDING
    }

    pub(crate) fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Acquire)
    }

    /// Push the deadline one interval forward for the next recurrence.
    pub(crate) fn advance_deadline(&self) {
        self.deadline_ms
            .fetch_add(self.interval_ms, Ordering::AcqRel);
    }

    pub(crate) fn remaining_rounds(&self) -> u64 {
        self.remaining_rounds.load(Ordering::Acquire)
    }

    pub(crate) fn set_remaining_rounds(&self, rounds: u64) {
        self.remaining_rounds.store(rounds, Ordering::Release);
    }

    /// Decrement the round count for one bucket visit; returns the new value.
    pub(crate) fn decrement_rounds(&self) -> u64 {
        let previous = self.remaining_rounds.load(Ordering::Acquire);
        let next = previous.saturating_sub(1);
        self.remaining_rounds.store(next, Ordering::Release);
        next
    }

    pub(crate) fn recurring_rounds(&self) -> u32 {
        self.recurring_rounds.load(Ordering::Acquire)
    }

    pub(crate) fn decrement_recurring(&self) {
        let previous = self.recurring_rounds.load(Ordering::Acquire);
        self.recurring_rounds
            .store(previous.saturating_sub(1), Ordering::Release);
    }

    /// Release this handle's admission slot. Idempotent; the counter is
    /// decremented exactly once per handle no matter how often this runs.
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.shared.release_slot();
        }
    }

    /// Execute the user task for one due visit.
    ///
    /// A non-recurring handle is marked expired and its slot released
    /// before the task runs, so a concurrent `cancel()` issued during
    /// execution returns `false` and cannot double-count the slot. The
    /// user task never propagates out of here: failures and panics go to
    /// the failure hook, a cooperative cancel flips the state.
    pub(crate) async fn expire(self: Arc<Self>, token: CancellationToken) {
        if !self.is_pending() {
            return;
        }
        if self.recurring_rounds() == 0 {
            if self
                .state
                .compare_exchange(
                    STATE_PENDING,
                    STATE_EXPIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // Lost the race against cancel().
                return;
            }
            self.release();
        }

        let run = AssertUnwindSafe(self.task.run(Arc::clone(&self), token)).catch_unwind();
        match run.await {
            Ok(TaskOutcome::Completed) => {
                tracing::trace!(timeout_id = self.id, "task completed");
            }
            Ok(TaskOutcome::Canceled) => {
                // Cooperative cancel. Only a still-pending (recurring)
                // handle can flip; an expired one stays expired.
                if self
                    .state
                    .compare_exchange(
                        STATE_PENDING,
                        STATE_CANCELED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.release();
                }
                tracing::debug!(timeout_id = self.id, "task observed cancellation");
            }
            Ok(TaskOutcome::Failed(error)) => {
                self.shared.report_failure(self.id, error);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.shared
                    .report_failure(self.id, format!("task panicked: {message}"));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            STATE_CANCELED => "canceled",
            STATE_EXPIRED => "expired",
            _ => "pending",
        };
        f.debug_struct("Timeout")
            .field("id", &self.id)
            .field("deadline_ms", &self.deadline_ms())
            .field("remaining_rounds", &self.remaining_rounds())
            .field("recurring_rounds", &self.recurring_rounds())
            .field("state", &state)
            .finish()
    }
}
