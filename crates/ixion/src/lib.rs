//! ixion: hashed wheel timer for coarse-grained timeout scheduling
//!
//! Schedules many thousands of delayed and optionally recurring tasks -
//! connection deadlines, retry windows, heartbeats, eviction deadlines -
//! with O(1) amortized insertion, cancellation and per-tick dispatch. The
//! trade is bounded jitter: a task fires within one tick interval of its
//! deadline, never before it.
//!
//! # Architecture
//!
//! A ring of `N` buckets (`N` a power of two) is advanced by a single
//! driver task, one bucket per tick:
//!
//! ```text
//! submit(task, delay) -> deadline -> bucket[(deadline / tick) & (N - 1)]
//!                                          |
//! driver (one tick): drain due queue -> run tasks (bounded fan-out)
//!                    -> reschedule recurrences -> age pending queue
//! ```
//!
//! Timeouts further out than one full revolution carry a round count that
//! is decremented on each visit; they fire on the first visit at round
//! zero. Cancellation is a lazy state flip: the entry is dropped the next
//! time its bucket sees it.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use ixion::{TimerBuilder, void_task_fn};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), ixion::TimerError> {
//! let timer = TimerBuilder::new()
//!     .tick_interval(Duration::from_millis(100))
//!     .bucket_count(512)
//!     .build()?;
//!
//! timer.start(CancellationToken::new())?;
//!
//! let heartbeat = timer.submit_recurring(
//!     void_task_fn(|| async { tracing::info!("heartbeat"); }),
//!     Duration::from_secs(1),
//!     9,
//! )?;
//!
//! // ... later
//! heartbeat.cancel();
//! let unprocessed = timer.stop().await;
//! # let _ = unprocessed;
//! # Ok(())
//! # }
//! ```

mod bucket;
mod clock;
mod config;
mod error;
mod handle;
mod task;
mod timer;
mod wheel;

pub use clock::MonotonicClock;
pub use config::{
    TimerBuilder, TimerConfig, MAX_BUCKET_COUNT, MAX_PARALLEL_EXPIRATIONS, MAX_PENDING_TIMEOUTS,
    MAX_WHEEL_SPAN,
};
pub use error::{Result, TimerError};
pub use handle::Timeout;
pub use task::{task_fn, void_task_fn, FnTask, TaskFuture, TaskOutcome, TimerTask};
pub use timer::{FailureContext, WheelTimer};
