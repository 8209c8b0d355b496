//! End-to-end timer behavior: delay discipline, recurrence, admission
//! control, overflow rounds, cancellation and shutdown accounting.
//!
//! Timing assertions use a small tick and generous upper bounds so the
//! suite stays stable on loaded machines; the lower bounds are exact
//! because the wheel never fires early.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ixion::{task_fn, void_task_fn, TaskOutcome, TimerBuilder, TimerError, TimerTask, WheelTimer};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn timer(tick_ms: u64, buckets: usize) -> WheelTimer {
    TimerBuilder::new()
        .tick_interval(Duration::from_millis(tick_ms))
        .bucket_count(buckets)
        .build()
        .unwrap()
}

/// Task that counts firings and records each firing's elapsed time.
fn recording_task(
    started: Instant,
    fires: Arc<AtomicUsize>,
    times_ms: Arc<Mutex<Vec<u64>>>,
) -> Arc<dyn TimerTask> {
    task_fn(move |_timeout, _token| {
        let fires = fires.clone();
        let times_ms = times_ms.clone();
        let elapsed = started.elapsed().as_millis() as u64;
        async move {
            fires.fetch_add(1, Ordering::SeqCst);
            times_ms.lock().push(elapsed);
            TaskOutcome::Completed
        }
    })
}

#[tokio::test]
async fn test_fires_once_after_delay() {
    init_tracing();
    let timer = timer(50, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    timer.start(CancellationToken::new()).unwrap();
    let handle = timer
        .submit(
            recording_task(started, fires.clone(), times.clone()),
            Duration::from_millis(400),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 1);
    let fired_at = times.lock()[0];
    assert!(fired_at >= 400, "fired early at {fired_at}ms");
    assert!(fired_at <= 800, "fired late at {fired_at}ms");
    assert!(handle.is_expired());
    assert!(!handle.is_canceled());
    assert_eq!(timer.pending_timeouts(), 0);
    timer.stop().await;
}

#[tokio::test]
async fn test_does_not_fire_before_delay() {
    init_tracing();
    let timer = timer(50, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));

    timer.start(CancellationToken::new()).unwrap();
    let handle = timer
        .submit(
            recording_task(Instant::now(), fires.clone(), times.clone()),
            Duration::from_secs(10),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 0);
    assert!(!handle.is_expired());

    let unprocessed = timer.stop().await;
    assert_eq!(unprocessed.len(), 1);
    assert_eq!(unprocessed[0].id(), handle.id());
}

#[tokio::test]
async fn test_admission_rejection_and_lazy_release() {
    init_tracing();
    let timer = TimerBuilder::new()
        .tick_interval(Duration::from_millis(50))
        .bucket_count(16)
        .max_pending_timeouts(2)
        .build()
        .unwrap();
    timer.start(CancellationToken::new()).unwrap();

    let noop = || void_task_fn(|| async {});
    let first = timer.submit(noop(), Duration::from_secs(5)).unwrap();
    let _second = timer.submit(noop(), Duration::from_secs(5)).unwrap();

    let err = timer.submit(noop(), Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, TimerError::Rejected { pending: 2, limit: 2 }));

    // The canceled entry is dropped the next time its bucket is visited,
    // which frees its admission slot.
    assert!(first.cancel());
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert!(timer.submit(noop(), Duration::from_secs(5)).is_ok());
    assert_eq!(timer.pending_timeouts(), 2);
    timer.stop().await;
}

#[tokio::test]
async fn test_deadline_beyond_one_revolution() {
    init_tracing();
    // 8 buckets x 20ms = 160ms span; 500ms needs three full revolutions.
    let timer = timer(20, 8);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    timer.start(CancellationToken::new()).unwrap();
    timer
        .submit(
            recording_task(started, fires.clone(), times.clone()),
            Duration::from_millis(500),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 1);
    let fired_at = times.lock()[0];
    assert!(fired_at >= 500, "fired early at {fired_at}ms");
    assert!(fired_at <= 800, "fired late at {fired_at}ms");
    timer.stop().await;
}

#[tokio::test]
async fn test_recurring_fires_count_plus_one_times() {
    init_tracing();
    let timer = timer(20, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    timer.start(CancellationToken::new()).unwrap();
    let handle = timer
        .submit_recurring(
            recording_task(started, fires.clone(), times.clone()),
            Duration::from_millis(100),
            2,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 3);
    {
        let times = times.lock();
        for (i, fired_at) in times.iter().enumerate() {
            let expected = 100 * (i as u64 + 1);
            assert!(
                *fired_at >= expected,
                "firing {i} early: {fired_at}ms < {expected}ms"
            );
            assert!(
                *fired_at <= expected + 300,
                "firing {i} late: {fired_at}ms"
            );
        }
    }
    assert!(handle.is_expired());
    assert_eq!(timer.pending_timeouts(), 0);
    timer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flood_of_tasks_all_fire_on_time() {
    init_tracing();
    let timer = timer(50, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let latest_ms = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    timer.start(CancellationToken::new()).unwrap();
    for _ in 0..1_000 {
        let fires = fires.clone();
        let latest_ms = latest_ms.clone();
        let task = task_fn(move |_timeout, _token| {
            let fires = fires.clone();
            let latest_ms = latest_ms.clone();
            let elapsed = started.elapsed().as_millis() as u64;
            async move {
                fires.fetch_add(1, Ordering::SeqCst);
                latest_ms.fetch_max(elapsed, Ordering::SeqCst);
                TaskOutcome::Completed
            }
        });
        timer.submit(task, Duration::from_millis(60)).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 1_000);
    let latest = latest_ms.load(Ordering::SeqCst);
    assert!(latest >= 60, "a task fired early at {latest}ms");
    assert!(latest <= 700, "slowest task fired at {latest}ms");
    assert_eq!(timer.pending_timeouts(), 0);
    timer.stop().await;
}

#[tokio::test]
async fn test_cancel_prevents_firing() {
    init_tracing();
    let timer = timer(20, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));

    timer.start(CancellationToken::new()).unwrap();
    let handle = timer
        .submit(
            recording_task(Instant::now(), fires.clone(), times.clone()),
            Duration::from_millis(200),
        )
        .unwrap();

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert!(handle.is_canceled());

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 0);
    assert!(!handle.is_expired());
    // The canceled entry was dropped at its bucket visit; stop reports
    // nothing.
    assert!(timer.stop().await.is_empty());
}

#[tokio::test]
async fn test_stop_accounting_is_lossless() {
    init_tracing();
    let timer = timer(50, 16);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let submitted = 6;

    timer.start(CancellationToken::new()).unwrap();
    let mut far = Vec::new();
    for _ in 0..3 {
        timer
            .submit(
                recording_task(Instant::now(), fires.clone(), times.clone()),
                Duration::from_millis(100),
            )
            .unwrap();
    }
    for _ in 0..3 {
        far.push(
            timer
                .submit(
                    recording_task(Instant::now(), fires.clone(), times.clone()),
                    Duration::from_secs(10),
                )
                .unwrap(),
        );
    }
    let canceled = 2;
    assert!(far[0].cancel());
    assert!(far[1].cancel());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let unprocessed = timer.stop().await;

    let fired = fires.load(Ordering::SeqCst);
    assert_eq!(fired, 3);
    assert_eq!(fired + canceled + unprocessed.len(), submitted);
    assert_eq!(unprocessed[0].id(), far[2].id());
}

#[tokio::test]
async fn test_cooperative_cancel_stops_recurrence() {
    init_tracing();
    let timer = timer(20, 64);
    let fires = Arc::new(AtomicUsize::new(0));

    let counter = fires.clone();
    let task = task_fn(move |_timeout, _token| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            TaskOutcome::Canceled
        }
    });

    timer.start(CancellationToken::new()).unwrap();
    let handle = timer
        .submit_recurring(task, Duration::from_millis(50), 5)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert!(handle.is_canceled());
    assert!(!handle.is_expired());
    assert_eq!(timer.pending_timeouts(), 0);
    timer.stop().await;
}

#[tokio::test]
async fn test_failed_task_reports_hook_and_counts_expired() {
    init_tracing();
    let timer = timer(20, 64);
    let failures = Arc::new(AtomicUsize::new(0));

    let seen = failures.clone();
    timer.set_failure_handler(move |context| {
        assert!(context.error.contains("kaboom"));
        seen.fetch_add(1, Ordering::SeqCst);
    });

    timer.start(CancellationToken::new()).unwrap();
    let handle = timer
        .submit(
            task_fn(|_timeout, _token| async { TaskOutcome::Failed("kaboom".to_string()) }),
            Duration::from_millis(50),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(handle.is_expired());
    assert_eq!(timer.pending_timeouts(), 0);

    // The driver survives the failure.
    let fires = Arc::new(AtomicUsize::new(0));
    let counter = fires.clone();
    timer
        .submit(
            void_task_fn(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Duration::from_millis(50),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    timer.stop().await;
}

#[tokio::test]
async fn test_zero_delay_fires_on_next_tick() {
    init_tracing();
    let timer = timer(20, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));

    timer.start(CancellationToken::new()).unwrap();
    timer
        .submit(
            recording_task(Instant::now(), fires.clone(), times.clone()),
            Duration::ZERO,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert!(times.lock()[0] <= 100);
    timer.stop().await;
}

#[tokio::test]
async fn test_slot_freed_after_expiration() {
    init_tracing();
    let timer = TimerBuilder::new()
        .tick_interval(Duration::from_millis(20))
        .bucket_count(16)
        .max_pending_timeouts(1)
        .build()
        .unwrap();
    timer.start(CancellationToken::new()).unwrap();

    timer
        .submit(void_task_fn(|| async {}), Duration::from_millis(50))
        .unwrap();
    assert!(matches!(
        timer.submit(void_task_fn(|| async {}), Duration::from_millis(50)),
        Err(TimerError::Rejected { .. })
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(timer.pending_timeouts(), 0);
    assert!(timer
        .submit(void_task_fn(|| async {}), Duration::from_millis(50))
        .is_ok());
    timer.stop().await;
}

#[tokio::test]
async fn test_submissions_before_start_fire_after_start() {
    init_tracing();
    let timer = timer(20, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));

    timer
        .submit(
            recording_task(Instant::now(), fires.clone(), times.clone()),
            Duration::from_millis(100),
        )
        .unwrap();

    // The driver catches up on ticks that elapsed before start.
    tokio::time::sleep(Duration::from_millis(250)).await;
    timer.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 1);
    timer.stop().await;
}

#[tokio::test]
async fn test_run_token_cancellation_stops_driver() {
    init_tracing();
    let timer = timer(20, 64);
    let fires = Arc::new(AtomicUsize::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));
    let token = CancellationToken::new();

    timer.start(token.clone()).unwrap();
    let handle = timer
        .submit(
            recording_task(Instant::now(), fires.clone(), times.clone()),
            Duration::from_millis(300),
        )
        .unwrap();

    token.cancel();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fires.load(Ordering::SeqCst), 0);
    let unprocessed = timer.stop().await;
    assert_eq!(unprocessed.len(), 1);
    assert_eq!(unprocessed[0].id(), handle.id());
}
