//! Wheel buckets: the due and pending queues behind each ring slot.
//!
//! Each bucket owns two FIFO multi-producer queues. Producers are any
//! submitter plus the recurrence path; the single consumer is the driver.
//! The queues are unbounded mpsc channels with the receiver half behind a
//! mutex, so `add` never blocks and drains are snapshot-bounded.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::handle::Timeout;

pub(crate) struct Bucket {
    due_tx: UnboundedSender<Arc<Timeout>>,
    due_rx: Mutex<UnboundedReceiver<Arc<Timeout>>>,
    pending_tx: UnboundedSender<Arc<Timeout>>,
    pending_rx: Mutex<UnboundedReceiver<Arc<Timeout>>>,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        let (due_tx, due_rx) = unbounded_channel();
        let (pending_tx, pending_rx) = unbounded_channel();
        Self {
            due_tx,
            due_rx: Mutex::new(due_rx),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
        }
    }

    /// Enqueue a handle. Entries that still owe full revolutions go to the
    /// pending queue; the rest fire on this bucket's next visit.
    ///
    /// Non-blocking and safe under concurrent producers. Send only fails
    /// when the receiver half is gone, which cannot outlive the bucket.
    pub(crate) fn add(&self, timeout: Arc<Timeout>) {
        if timeout.remaining_rounds() == 0 {
            let _ = self.due_tx.send(timeout);
        } else {
            let _ = self.pending_tx.send(timeout);
        }
    }

    /// Drain the due queue and execute every live entry, at most
    /// `max_parallel` at a time.
    ///
    /// Returns the handles that finished with recurrences still owed; the
    /// wheel re-deadlines and re-inserts them. All launched executions are
    /// awaited before returning, so the aging pass for this tick never
    /// overlaps task execution.
    pub(crate) async fn expire_due(
        &self,
        now_ms: u64,
        max_parallel: usize,
        token: &CancellationToken,
    ) -> Vec<Arc<Timeout>> {
        let mut batch = Vec::new();
        {
            let mut due = self.due_rx.lock();
            let snapshot = due.len();
            for _ in 0..snapshot {
                if token.is_cancelled() {
                    break;
                }
                let Ok(timeout) = due.try_recv() else { break };
                if timeout.is_canceled() {
                    timeout.release();
                    continue;
                }
                if timeout.deadline_ms() > now_ms {
                    // Re-insertion race left an entry ahead of the clock;
                    // it fires on a later visit.
                    tracing::debug!(
                        timeout_id = timeout.id(),
                        deadline_ms = timeout.deadline_ms(),
                        now_ms,
                        "due entry ahead of clock, requeueing"
                    );
                    let _ = self.due_tx.send(timeout);
                    continue;
                }
                batch.push(timeout);
            }
        }
        if batch.is_empty() {
            return Vec::new();
        }

        // Fresh semaphore per pass: fan-out is scoped to this tick and
        // cannot interfere with the next one.
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut executions: JoinSet<Arc<Timeout>> = JoinSet::new();
        for timeout in batch {
            let permit = tokio::select! {
                _ = token.cancelled() => {
                    // Hand the entry back so stop() can report it.
                    let _ = self.due_tx.send(timeout);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let run_token = token.clone();
            executions.spawn(async move {
                let _permit = permit;
                Arc::clone(&timeout).expire(run_token).await;
                timeout
            });
        }

        let mut recurrences = Vec::new();
        while let Some(joined) = executions.join_next().await {
            match joined {
                Ok(timeout) => {
                    if timeout.is_canceled() {
                        timeout.release();
                    } else if !timeout.is_expired() && timeout.recurring_rounds() > 0 {
                        recurrences.push(timeout);
                    }
                }
                Err(error) => {
                    tracing::error!(error = %error, "timer task join failed");
                }
            }
        }
        recurrences
    }

    /// One aging pass: drop canceled entries and move entries whose round
    /// count reaches zero over to the due queue.
    ///
    /// Bounded by the queue length at entry, so entries inserted while
    /// aging runs are not re-processed this tick.
    pub(crate) fn age(&self, token: &CancellationToken) {
        let mut pending = self.pending_rx.lock();
        let snapshot = pending.len();
        for _ in 0..snapshot {
            if token.is_cancelled() {
                break;
            }
            let Ok(timeout) = pending.try_recv() else { break };
            if timeout.is_canceled() {
                timeout.release();
                continue;
            }
            if timeout.decrement_rounds() == 0 {
                let _ = self.due_tx.send(timeout);
            } else {
                let _ = self.pending_tx.send(timeout);
            }
        }
    }

    /// Yield every live entry left in this bucket at stop time, pending
    /// queue first. Canceled entries are dropped, releasing their slots.
    pub(crate) fn drain_unprocessed(&self, out: &mut Vec<Arc<Timeout>>) {
        {
            let mut pending = self.pending_rx.lock();
            while let Ok(timeout) = pending.try_recv() {
                if timeout.is_canceled() {
                    timeout.release();
                } else {
                    out.push(timeout);
                }
            }
        }
        let mut due = self.due_rx.lock();
        while let Ok(timeout) = due.try_recv() {
            if timeout.is_canceled() {
                timeout.release();
            } else {
                out.push(timeout);
            }
        }
    }

    /// Number of queued entries across both queues (for tests).
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.due_rx.lock().len() + self.pending_rx.lock().len()
    }
}
