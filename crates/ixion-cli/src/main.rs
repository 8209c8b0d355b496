//! ixion demo CLI
//!
//! Usage:
//!   ixion oneshot --delay-ms 2000          Fire one task after a delay
//!   ixion recurring --interval-ms 1000 -n 4  Fire a task repeatedly
//!   ixion flood --count 10000              Stress the wheel with many tasks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ixion::{task_fn, TaskOutcome, TimerBuilder, WheelTimer};

#[derive(Parser)]
#[command(name = "ixion")]
#[command(about = "Hashed wheel timer demos", long_about = None)]
#[command(version)]
struct Cli {
    /// Tick interval in milliseconds
    #[arg(long, default_value_t = 100, global = true)]
    tick_ms: u64,

    /// Number of wheel buckets (rounded up to a power of two)
    #[arg(long, default_value_t = 512, global = true)]
    buckets: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a single task and wait for it to fire
    Oneshot {
        /// Delay before the task fires, in milliseconds
        #[arg(long, default_value_t = 2_000)]
        delay_ms: u64,
    },
    /// Schedule a recurring task
    Recurring {
        /// Interval between firings, in milliseconds
        #[arg(long, default_value_t = 1_000)]
        interval_ms: u64,

        /// Number of repetitions after the first firing
        #[arg(short = 'n', long, default_value_t = 4)]
        repeats: u32,
    },
    /// Submit many short timeouts at once and report throughput
    Flood {
        /// Number of tasks to submit
        #[arg(long, default_value_t = 10_000)]
        count: usize,

        /// Delay for every task, in milliseconds
        #[arg(long, default_value_t = 250)]
        delay_ms: u64,
    },
}

fn build_timer(cli: &Cli) -> Result<WheelTimer> {
    let timer = TimerBuilder::new()
        .tick_interval(Duration::from_millis(cli.tick_ms))
        .bucket_count(cli.buckets)
        .build()?;
    Ok(timer)
}

async fn run_oneshot(timer: &WheelTimer, delay_ms: u64) -> Result<()> {
    let started = Instant::now();
    let handle = timer.submit(
        task_fn(move |timeout, _token| {
            let elapsed = started.elapsed();
            async move {
                tracing::info!(
                    timeout_id = timeout.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task fired"
                );
                TaskOutcome::Completed
            }
        }),
        Duration::from_millis(delay_ms),
    )?;

    while !handle.is_expired() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn run_recurring(timer: &WheelTimer, interval_ms: u64, repeats: u32) -> Result<()> {
    let started = Instant::now();
    let handle = timer.submit_recurring(
        task_fn(move |timeout, _token| {
            let elapsed = started.elapsed();
            async move {
                tracing::info!(
                    timeout_id = timeout.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "recurring task fired"
                );
                TaskOutcome::Completed
            }
        }),
        Duration::from_millis(interval_ms),
        repeats,
    )?;

    while !handle.is_expired() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn run_flood(timer: &WheelTimer, count: usize, delay_ms: u64) -> Result<()> {
    let fired = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    for _ in 0..count {
        let fired = fired.clone();
        timer.submit(
            task_fn(move |_timeout, _token| {
                let fired = fired.clone();
                async move {
                    fired.fetch_add(1, Ordering::Relaxed);
                    TaskOutcome::Completed
                }
            }),
            Duration::from_millis(delay_ms),
        )?;
    }
    tracing::info!(
        count,
        submit_ms = started.elapsed().as_millis() as u64,
        "all tasks submitted"
    );

    while fired.load(Ordering::Relaxed) < count {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracing::info!(
        count,
        total_ms = started.elapsed().as_millis() as u64,
        "all tasks fired"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let timer = build_timer(&cli)?;
    timer.start(CancellationToken::new())?;

    match cli.command {
        Commands::Oneshot { delay_ms } => run_oneshot(&timer, delay_ms).await?,
        Commands::Recurring {
            interval_ms,
            repeats,
        } => run_recurring(&timer, interval_ms, repeats).await?,
        Commands::Flood { count, delay_ms } => run_flood(&timer, count, delay_ms).await?,
    }

    let unprocessed = timer.stop().await;
    tracing::debug!(unprocessed = unprocessed.len(), "timer stopped");
    Ok(())
}
