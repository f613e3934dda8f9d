use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::TaskError;
use crate::metrics::RunnerMetrics;
use crate::routine::{RoutineCore, StepOutcome};

/// An execution context that repeatedly resumes queued routines until each
/// reports completion.
pub trait Scheduler: Send + Sync {
    /// Put a routine into this scheduler's rotation.
    fn schedule(&self, routine: Arc<RoutineCore>) -> Result<(), TaskError>;
}

const PHASE_IDLE: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_STOPPED: u8 = 2;

struct RunnerShared {
    queue: Mutex<VecDeque<Arc<RoutineCore>>>,
    work_available: Condvar,
    phase: AtomicU8,
    metrics: RwLock<RunnerMetrics>,
}

/// A runner that owns one background OS thread and loops continuously over
/// its queue: pop the next routine, resume it for one quantum, requeue it if
/// more work remains, drop it otherwise. The thread parks on a condvar when
/// the queue is empty.
///
/// The thread is spawned lazily on the first scheduled routine and lives
/// until [`stop`](ThreadRunner::stop) (also called on drop). A stopped
/// runner is terminal: it rejects further routines and a new instance must
/// be created instead.
pub struct ThreadRunner {
    name: String,
    shared: Arc<RunnerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(RunnerShared {
                queue: Mutex::new(VecDeque::new()),
                work_available: Condvar::new(),
                phase: AtomicU8::new(PHASE_IDLE),
                metrics: RwLock::new(RunnerMetrics::default()),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the background thread is live.
    pub fn is_running(&self) -> bool {
        self.shared.phase.load(Ordering::Acquire) == PHASE_RUNNING
    }

    /// Snapshot of this runner's metrics.
    pub fn metrics(&self) -> RunnerMetrics {
        self.shared
            .metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Stop the runner and join its thread. Terminal; queued routines are
    /// discarded.
    pub fn stop(&self) {
        let prev = self.shared.phase.swap(PHASE_STOPPED, Ordering::AcqRel);
        self.shared.work_available.notify_all();
        if prev == PHASE_RUNNING {
            debug!(runner = %self.name, "stopping runner");
        }
        let handle = match self.handle.lock() {
            Ok(mut h) => h.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            // Joining from the worker itself would deadlock.
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!(runner = %self.name, "worker thread terminated by panic");
            }
        }
    }

    fn ensure_thread(&self) -> Result<(), TaskError> {
        if self
            .shared
            .phase
            .compare_exchange(PHASE_IDLE, PHASE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let spawn = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_loop(&shared));
        match spawn {
            Ok(h) => {
                debug!(runner = %self.name, "worker thread spawned");
                if let Ok(mut slot) = self.handle.lock() {
                    *slot = Some(h);
                }
                Ok(())
            }
            Err(e) => {
                self.shared.phase.store(PHASE_STOPPED, Ordering::Release);
                Err(TaskError::Spawn(e))
            }
        }
    }
}

impl Scheduler for ThreadRunner {
    fn schedule(&self, routine: Arc<RoutineCore>) -> Result<(), TaskError> {
        if self.shared.phase.load(Ordering::Acquire) == PHASE_STOPPED {
            return Err(TaskError::RunnerStopped);
        }
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .map_err(|e| TaskError::LockPoisoned(format!("runner queue lock: {e}")))?;
            queue.push_back(routine);
        }
        self.ensure_thread()?;
        self.shared.work_available.notify_one();
        Ok(())
    }
}

impl Drop for ThreadRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: &Arc<RunnerShared>) {
    loop {
        let routine = {
            let mut queue = match shared.queue.lock() {
                Ok(q) => q,
                Err(_) => return,
            };
            loop {
                if shared.phase.load(Ordering::Acquire) == PHASE_STOPPED {
                    return;
                }
                if let Some(core) = queue.pop_front() {
                    break core;
                }
                queue = match shared.work_available.wait(queue) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        };

        let started = Instant::now();
        let outcome = routine.step();
        record_outcome(shared, &routine, started, outcome);
    }
}

/// Fold one quantum into a runner's metrics. Shared by the dedicated-thread
/// loop and the host-driven tick.
fn note_quantum(metrics: &RwLock<RunnerMetrics>, started: Instant, outcome: &StepOutcome) {
    if let Ok(mut m) = metrics.write() {
        m.record_quantum(started.elapsed());
        match outcome {
            StepOutcome::Completed => m.record_completion(),
            StepOutcome::Stopped => m.record_stop(),
            StepOutcome::Faulted(_) => m.record_fault(),
            StepOutcome::Requeue => {}
        }
    }
}

/// Record one quantum and requeue/drop the routine accordingly.
fn record_outcome(
    shared: &RunnerShared,
    routine: &Arc<RoutineCore>,
    started: Instant,
    outcome: StepOutcome,
) {
    note_quantum(&shared.metrics, started, &outcome);
    match outcome {
        StepOutcome::Requeue => {
            if let Ok(mut queue) = shared.queue.lock() {
                queue.push_back(Arc::clone(routine));
            }
        }
        StepOutcome::Completed => {
            debug!(routine = %routine.name(), "task completed");
        }
        StepOutcome::Stopped => {
            debug!(routine = %routine.name(), "routine removed by stop request");
        }
        StepOutcome::Faulted(e) => {
            error!(routine = %routine.name(), error = %e, "task faulted; dropping routine");
        }
    }
}

/// A host-driven runner: the host calls [`tick`](TickRunner::tick) once per
/// iteration of its own loop and every queued routine is resumed for one
/// quantum. This crate does not own that loop.
#[derive(Default)]
pub struct TickRunner {
    shared: TickShared,
}

#[derive(Default)]
struct TickShared {
    queue: Mutex<VecDeque<Arc<RoutineCore>>>,
    metrics: RwLock<RunnerMetrics>,
}

impl TickRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume every queued routine once. Returns the number of routines
    /// still in rotation.
    pub fn tick(&self) -> usize {
        let batch: Vec<Arc<RoutineCore>> = match self.shared.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return 0,
        };

        let mut survivors = VecDeque::with_capacity(batch.len());
        for routine in batch {
            let started = Instant::now();
            let outcome = routine.step();
            let requeue = matches!(outcome, StepOutcome::Requeue);
            record_tick_outcome(&self.shared, &routine, started, outcome);
            if requeue {
                survivors.push_back(routine);
            }
        }

        match self.shared.queue.lock() {
            Ok(mut queue) => {
                // Routines scheduled during the tick are already queued;
                // survivors go behind them.
                queue.append(&mut survivors);
                queue.len()
            }
            Err(_) => 0,
        }
    }

    /// Number of routines currently queued.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn metrics(&self) -> RunnerMetrics {
        self.shared
            .metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

fn record_tick_outcome(
    shared: &TickShared,
    routine: &Arc<RoutineCore>,
    started: Instant,
    outcome: StepOutcome,
) {
    note_quantum(&shared.metrics, started, &outcome);
    if let StepOutcome::Faulted(e) = outcome {
        error!(routine = %routine.name(), error = %e, "task faulted; dropping routine");
    }
}

impl Scheduler for TickRunner {
    fn schedule(&self, routine: Arc<RoutineCore>) -> Result<(), TaskError> {
        let mut queue = self
            .shared
            .queue
            .lock()
            .map_err(|e| TaskError::LockPoisoned(format!("runner queue lock: {e}")))?;
        queue.push_back(routine);
        Ok(())
    }
}
