//! weft-demo — drives a synthetic workload through the worker pool.
//!
//! Submits `--tasks` spin tasks (each burning `--quanta` resume quanta of
//! simulated work) to a pool of `--threads` workers, polls the orchestrator
//! to completion, and dumps aggregated runner metrics as JSON.
//!
//! With `--nested`, the orchestrator itself is bound to a routine on a
//! host-driven tick runner, exercising the poll-don't-block contract the
//! same way a host loop would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft::{
    from_fn, MultiThreadParallelTaskCollection, PoolConfig, Resume, Scheduler, Task, TaskRoutine,
    TaskState, TickRunner,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Synthetic workload driver for the weft task pool.
#[derive(Parser, Debug)]
#[command(name = "weft-demo", version, about)]
struct Cli {
    /// Worker threads in the pool (ignored when --config is given).
    #[arg(long, env = "WEFT_THREADS", default_value_t = 4)]
    threads: usize,

    /// Number of tasks to submit.
    #[arg(long, env = "WEFT_TASKS", default_value_t = 16)]
    tasks: usize,

    /// Resume quanta each task needs before completing.
    #[arg(long, env = "WEFT_QUANTA", default_value_t = 100)]
    quanta: usize,

    /// Path to a pool.toml config file.
    #[arg(long, env = "WEFT_CONFIG")]
    config: Option<String>,

    /// Drive the pool nested inside a host-driven tick runner.
    #[arg(long, default_value_t = false)]
    nested: bool,
}

// ── Workload ────────────────────────────────────────────────────────

/// One spin task: a short busy-wait per quantum, `quanta` quanta total.
fn spin_task(quanta: usize, completed: Arc<AtomicUsize>) -> impl FnMut() -> Result<Resume, weft::TaskError> + Send {
    let mut left = quanta;
    move || {
        std::hint::black_box((0..500).sum::<u64>());
        left -= 1;
        if left == 0 {
            completed.fetch_add(1, Ordering::Relaxed);
            Ok(Resume::Done)
        } else {
            Ok(Resume::More)
        }
    }
}

fn build_pool(cli: &Cli) -> anyhow::Result<MultiThreadParallelTaskCollection> {
    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
        }
        None => PoolConfig {
            worker_threads: cli.threads,
            ..PoolConfig::default()
        },
    };
    info!(
        workers = config.resolved_worker_threads(),
        "building worker pool"
    );
    Ok(MultiThreadParallelTaskCollection::from_config(&config)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.quanta > 0, "--quanta must be at least 1");
    let mut pool = build_pool(&cli)?;

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..cli.tasks {
        pool.add(Box::new(from_fn(spin_task(
            cli.quanta,
            Arc::clone(&completed),
        ))))?;
    }
    info!(tasks = cli.tasks, quanta = cli.quanta, "workload submitted");

    let started = Instant::now();
    if cli.nested {
        run_nested(pool, &completed, cli.tasks, started)?;
    } else {
        run_polled(pool, &completed, cli.tasks, started)?;
    }
    Ok(())
}

// ── Drivers ─────────────────────────────────────────────────────────

/// Poll the orchestrator directly from the main thread.
fn run_polled(
    mut pool: MultiThreadParallelTaskCollection,
    completed: &AtomicUsize,
    expected: usize,
    started: Instant,
) -> anyhow::Result<()> {
    loop {
        match pool.resume()? {
            Resume::Done => break,
            Resume::More => std::thread::sleep(Duration::from_micros(200)),
        }
    }
    report(&pool.metrics(), completed, expected, started)
}

/// Nest the orchestrator in a tick runner, the way a host loop would.
fn run_nested(
    pool: MultiThreadParallelTaskCollection,
    completed: &AtomicUsize,
    expected: usize,
    started: Instant,
) -> anyhow::Result<()> {
    let pool = Arc::new(Mutex::new(pool));
    let runner = Arc::new(TickRunner::new());

    let mut routine = TaskRoutine::new("orchestrator");
    routine
        .set_task(Box::new(Arc::clone(&pool)))?
        .set_scheduler(Arc::clone(&runner) as Arc<dyn Scheduler>)?;
    routine.start()?;

    while runner.tick() > 0 {
        std::thread::sleep(Duration::from_micros(200));
    }
    anyhow::ensure!(
        routine.state() == TaskState::Completed,
        "orchestrator routine ended in state {:?}",
        routine.state()
    );

    let metrics = pool
        .lock()
        .map_err(|_| anyhow::anyhow!("pool lock poisoned"))?
        .metrics();
    report(&metrics, completed, expected, started)
}

fn report(
    metrics: &weft::RunnerMetrics,
    completed: &AtomicUsize,
    expected: usize,
    started: Instant,
) -> anyhow::Result<()> {
    let elapsed = started.elapsed();
    info!(
        completed = completed.load(Ordering::Relaxed),
        expected,
        elapsed_ms = elapsed.as_millis() as u64,
        "workload complete"
    );
    println!("{}", serde_json::to_string_pretty(metrics)?);
    Ok(())
}
