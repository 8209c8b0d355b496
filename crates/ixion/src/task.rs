//! Core task trait and closure adapters

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::handle::Timeout;

/// Completion signal returned by one task execution.
///
/// The timer never inspects anything beyond this value: `Canceled` flips
/// the handle state, `Failed` goes to the failure hook, and the driver
/// keeps ticking in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task ran to completion.
    Completed,
    /// Task observed the run cancel token and bailed out cooperatively.
    Canceled,
    /// Task failed; the error is reported through the failure hook.
    Failed(String),
}

/// Core timer task trait - implemented by anything the wheel dispatches.
///
/// Implementations receive their own [`Timeout`] handle (to observe
/// cancellation state or identity) and the run cancel token, which
/// long-running tasks are expected to honor.
#[async_trait]
pub trait TimerTask: Send + Sync + 'static {
    /// Perform the work for one expiration.
    async fn run(&self, timeout: Arc<Timeout>, token: CancellationToken) -> TaskOutcome;
}

/// Boxed future produced by a task closure.
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

/// Adapter turning a closure into a [`TimerTask`].
///
/// This is the base of the adapter family; the [`task_fn`] and
/// [`void_task_fn`] helpers cover the common shapes.
pub struct FnTask<F> {
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(Arc<Timeout>, CancellationToken) -> TaskFuture + Send + Sync + 'static,
{
    /// Wrap a closure producing a boxed task future.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TimerTask for FnTask<F>
where
    F: Fn(Arc<Timeout>, CancellationToken) -> TaskFuture + Send + Sync + 'static,
{
    async fn run(&self, timeout: Arc<Timeout>, token: CancellationToken) -> TaskOutcome {
        (self.f)(timeout, token).await
    }
}

/// Wrap an async closure as a timer task.
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TimerTask>
where
    F: Fn(Arc<Timeout>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(FnTask::new(move |timeout, token| {
        Box::pin(f(timeout, token)) as TaskFuture
    }))
}

/// Wrap a fire-and-forget async closure that cannot fail.
pub fn void_task_fn<F, Fut>(f: F) -> Arc<dyn TimerTask>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    task_fn(move |_timeout, _token| {
        let fut = f();
        async move {
            fut.await;
            TaskOutcome::Completed
        }
    })
}
