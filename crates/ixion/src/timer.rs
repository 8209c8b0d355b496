//! Timer facade: submission, start, stop and admission control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::ceil_millis;
use crate::config::{TimerBuilder, TimerConfig};
use crate::error::TimerError;
use crate::handle::Timeout;
use crate::task::TimerTask;
use crate::wheel::Wheel;

/// Context handed to the failure hook when a user task fails.
#[derive(Debug, Clone)]
pub struct FailureContext {
    /// Id of the timeout whose execution failed.
    pub timeout_id: u64,
    /// Error message reported by the task (or the panic payload).
    pub error: String,
}

type FailureHandler = Arc<dyn Fn(&FailureContext) + Send + Sync>;

/// State shared between the facade, the wheel and every handle: the
/// admission counter and the failure hook.
pub(crate) struct TimerShared {
    pending: AtomicU64,
    max_pending: u64,
    failure_handler: RwLock<Option<FailureHandler>>,
}

impl TimerShared {
    pub(crate) fn new(max_pending: u64) -> Self {
        Self {
            pending: AtomicU64::new(0),
            max_pending,
            failure_handler: RwLock::new(None),
        }
    }

    /// Reserve one admission slot, or reject when the ceiling is reached.
    pub(crate) fn try_admit(&self) -> Result<(), TimerError> {
        if self.max_pending == 0 {
            self.pending.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        let result = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count >= self.max_pending {
                    None
                } else {
                    Some(count + 1)
                }
            });
        match result {
            Ok(_) => Ok(()),
            Err(count) => Err(TimerError::Rejected {
                pending: count,
                limit: self.max_pending,
            }),
        }
    }

    pub(crate) fn release_slot(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_failure_handler(&self, handler: FailureHandler) {
        *self.failure_handler.write() = Some(handler);
    }

    /// Report one failed execution. The handler runs outside the lock and
    /// is invoked at most once per failure.
    pub(crate) fn report_failure(&self, timeout_id: u64, error: String) {
        let handler = self.failure_handler.read().clone();
        let context = FailureContext { timeout_id, error };
        match handler {
            Some(handler) => handler(&context),
            None => {
                tracing::error!(
                    timeout_id = context.timeout_id,
                    error = %context.error,
                    "timer task failed"
                );
            }
        }
    }
}

struct DriverHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Hashed wheel timer.
///
/// Schedules large volumes of delayed and optionally recurring tasks with
/// O(1) amortized insertion, cancellation and per-tick dispatch, trading
/// bounded jitter (one tick interval) for throughput. The wheel is a
/// dispatcher, not an executor: tasks that block for longer than
/// `tick_interval x max_parallel_expirations` starve their bucket's
/// parallel slots.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use ixion::{TimerBuilder, void_task_fn};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> Result<(), ixion::TimerError> {
/// let timer = TimerBuilder::new()
///     .tick_interval(Duration::from_millis(100))
///     .build()?;
/// timer.start(CancellationToken::new())?;
/// let handle = timer.submit(
///     void_task_fn(|| async { println!("fired"); }),
///     Duration::from_secs(2),
/// )?;
/// # let _ = handle;
/// # Ok(())
/// # }
/// ```
pub struct WheelTimer {
    config: TimerConfig,
    wheel: Arc<Wheel>,
    shared: Arc<TimerShared>,
    next_id: AtomicU64,
    driver: Mutex<Option<DriverHandle>>,
}

impl WheelTimer {
    /// Builder with the default configuration.
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// Construct from an already-validated configuration.
    pub(crate) fn with_config(config: TimerConfig) -> Self {
        let wheel = Arc::new(Wheel::new(
            config.bucket_count,
            config.tick_ms(),
            config.max_parallel_expirations,
        ));
        let shared = Arc::new(TimerShared::new(config.max_pending_timeouts));
        Self {
            config,
            wheel,
            shared,
            next_id: AtomicU64::new(0),
            driver: Mutex::new(None),
        }
    }

    /// The configuration this timer was built with (normalized).
    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    /// Number of timeouts currently holding an admission slot.
    pub fn pending_timeouts(&self) -> u64 {
        self.shared.pending()
    }

    /// Install the hook invoked when a user task fails with a non-cancel
    /// error. Without one, failures are logged.
    pub fn set_failure_handler<F>(&self, handler: F)
    where
        F: Fn(&FailureContext) + Send + Sync + 'static,
    {
        self.shared.set_failure_handler(Arc::new(handler));
    }

    /// Schedule a task to fire once after `delay`.
    ///
    /// A zero delay fires on the next tick. Fails with
    /// [`TimerError::InvalidState`] after shutdown and with
    /// [`TimerError::Rejected`] when the admission ceiling is reached.
    pub fn submit(
        &self,
        task: Arc<dyn TimerTask>,
        delay: Duration,
    ) -> Result<Arc<Timeout>, TimerError> {
        self.submit_with(task, delay, 0)
    }

    /// Schedule a task to fire after `delay` and then `recurring` more
    /// times at the same interval (recurring + 1 total executions).
    pub fn submit_recurring(
        &self,
        task: Arc<dyn TimerTask>,
        delay: Duration,
        recurring: u32,
    ) -> Result<Arc<Timeout>, TimerError> {
        self.submit_with(task, delay, recurring)
    }

    fn submit_with(
        &self,
        task: Arc<dyn TimerTask>,
        delay: Duration,
        recurring: u32,
    ) -> Result<Arc<Timeout>, TimerError> {
        if self.wheel.is_shutdown() {
            return Err(TimerError::InvalidState("timer is shut down".to_string()));
        }
        self.shared.try_admit()?;

        let deadline_ms = ceil_millis(self.wheel.clock().deadline_from(delay));
        let interval_ms = ceil_millis(delay);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = Timeout::new(
            id,
            task,
            deadline_ms,
            interval_ms,
            recurring,
            Arc::clone(&self.shared),
        );
        self.wheel.place(&timeout);
        tracing::debug!(
            timeout_id = id,
            deadline_ms,
            recurring,
            "timeout submitted"
        );
        Ok(timeout)
    }

    /// Start the driver loop on a background task.
    ///
    /// The token is cooperative: the driver checks it at every sleep and
    /// dequeue boundary and hands it to running tasks. Idempotent while
    /// started; fails with [`TimerError::InvalidState`] after shutdown.
    pub fn start(&self, token: CancellationToken) -> Result<(), TimerError> {
        if !self.wheel.transition_started()? {
            tracing::debug!("timer already started");
            return Ok(());
        }
        let drive_token = token.child_token();
        let wheel = Arc::clone(&self.wheel);
        let run_token = drive_token.clone();
        let join = tokio::spawn(async move { wheel.run(run_token).await });
        *self.driver.lock() = Some(DriverHandle {
            token: drive_token,
            join,
        });
        Ok(())
    }

    /// Stop the driver and collect every timeout that never fired.
    ///
    /// Returns the unprocessed handles in bucket order, pending queue
    /// before due queue within each bucket. Canceled handles are not
    /// reported. A second stop returns an empty list.
    pub async fn stop(&self) -> Vec<Arc<Timeout>> {
        self.wheel.shutdown();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.token.cancel();
            if let Err(error) = driver.join.await {
                tracing::error!(error = %error, "timer driver join failed");
            }
        }
        let unprocessed = self.wheel.drain_unprocessed();
        tracing::info!(unprocessed = unprocessed.len(), "timer stopped");
        unprocessed
    }
}

impl std::fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WheelTimer")
            .field("config", &self.config)
            .field("pending", &self.pending_timeouts())
            .finish()
    }
}
