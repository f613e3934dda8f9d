use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::TaskError;
use crate::runner::Scheduler;
use crate::task::{Resume, Task, TaskState};

/// What a runner should do with a routine after driving it for one quantum.
#[derive(Debug)]
pub enum StepOutcome {
    /// More work remains; put the routine back in rotation.
    Requeue,
    /// The bound task reported completion; drop the routine from rotation.
    Completed,
    /// A stop request was honored before the quantum ran.
    Stopped,
    /// The bound task faulted; the error is returned for the runner to report.
    Faulted(TaskError),
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    running: bool,
    stop_requested: bool,
    restart_pending: bool,
}

/// State shared between a [`TaskRoutine`] handle and the scheduler driving it.
///
/// Schedulers hold `Arc<RoutineCore>` entries in their queues and call
/// [`step`](RoutineCore::step) once per quantum; the handle side performs
/// start/stop/rebind transitions. All transitions go through the lifecycle
/// mutex, so at most one runner drives the bound task at any instant.
pub struct RoutineCore {
    name: String,
    task: Mutex<Option<Box<dyn Task>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl RoutineCore {
    fn new(name: String) -> Self {
        Self {
            name,
            task: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Ready,
                running: false,
                stop_requested: false,
                restart_pending: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.lock_lifecycle().state
    }

    pub fn is_running(&self) -> bool {
        self.lock_lifecycle().running
    }

    /// Drive the bound task for one quantum.
    ///
    /// This is the single resume transition every runner goes through:
    /// honor a pending stop, resume the task with only the task lock held,
    /// then record the outcome. The task lock is never held while waiting
    /// for the lifecycle lock.
    pub fn step(&self) -> StepOutcome {
        {
            let mut lc = self.lock_lifecycle();
            if lc.stop_requested {
                lc.stop_requested = false;
                lc.restart_pending = false;
                lc.running = false;
                return StepOutcome::Stopped;
            }
        }

        let result = match self.task.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(task) => task.resume(),
                None => Ok(Resume::Done),
            },
            Err(e) => Err(TaskError::LockPoisoned(format!("routine task lock: {e}"))),
        };

        let mut lc = self.lock_lifecycle();
        match result {
            Ok(Resume::More) => {
                lc.state = TaskState::Suspended;
                StepOutcome::Requeue
            }
            Ok(Resume::Done) => {
                if lc.restart_pending {
                    lc.restart_pending = false;
                    lc.state = TaskState::Ready;
                    StepOutcome::Requeue
                } else {
                    lc.state = TaskState::Completed;
                    lc.running = false;
                    StepOutcome::Completed
                }
            }
            Err(e) => {
                lc.state = TaskState::Faulted;
                lc.running = false;
                lc.restart_pending = false;
                StepOutcome::Faulted(e)
            }
        }
    }

    fn bind_task(&self, task: Box<dyn Task>) -> Result<(), TaskError> {
        let mut lc = self.lock_lifecycle();
        if lc.running {
            return Err(TaskError::RoutineRunning);
        }
        let mut slot = self
            .task
            .lock()
            .map_err(|e| TaskError::LockPoisoned(format!("routine task lock: {e}")))?;
        *slot = Some(task);
        lc.state = TaskState::Ready;
        Ok(())
    }

    /// Flip the running flag and decide whether the caller should enqueue.
    ///
    /// Starting an already-running routine queues exactly one rerun, consumed
    /// by [`step`](RoutineCore::step) when the current pass completes.
    fn begin_start(&self) -> Result<bool, TaskError> {
        let mut lc = self.lock_lifecycle();
        if lc.running {
            lc.restart_pending = true;
            return Ok(false);
        }
        let bound = self
            .task
            .lock()
            .map_err(|e| TaskError::LockPoisoned(format!("routine task lock: {e}")))?
            .is_some();
        if !bound {
            return Err(TaskError::MissingTask);
        }
        lc.state = TaskState::Ready;
        lc.stop_requested = false;
        lc.running = true;
        Ok(true)
    }

    fn abort_start(&self) {
        self.lock_lifecycle().running = false;
    }

    fn request_stop(&self) {
        let mut lc = self.lock_lifecycle();
        if lc.running {
            lc.stop_requested = true;
            lc.restart_pending = false;
        }
    }

    // The lifecycle lock only guards plain field flips, so it can't be
    // poisoned by task code.
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A reusable handle binding one cooperative task to one scheduler.
///
/// Routines are allocated once (through a [`RoutinePool`]) and rebound to
/// new tasks and schedulers across their lifetime; rebinding while running
/// is a usage error.
pub struct TaskRoutine {
    core: Arc<RoutineCore>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl TaskRoutine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: Arc::new(RoutineCore::new(name.into())),
            scheduler: None,
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Bind the task this routine will drive. Errors while running.
    pub fn set_task(&mut self, task: Box<dyn Task>) -> Result<&mut Self, TaskError> {
        self.core.bind_task(task)?;
        Ok(self)
    }

    /// Bind the scheduler this routine starts on. Errors while running.
    pub fn set_scheduler(&mut self, scheduler: Arc<dyn Scheduler>) -> Result<&mut Self, TaskError> {
        if self.core.is_running() {
            return Err(TaskError::RoutineRunning);
        }
        self.scheduler = Some(scheduler);
        Ok(self)
    }

    /// Register the routine with its scheduler's queue and flip the running
    /// flag.
    ///
    /// Safe to call from any thread, including threads other than the one
    /// driving the scheduler: the transition is mutex-guarded and the only
    /// other effect is an enqueue. Starting a routine that is already
    /// running requests one rerun after the current pass completes.
    pub fn start(&self) -> Result<(), TaskError> {
        let scheduler = self.scheduler.as_ref().ok_or(TaskError::MissingScheduler)?;
        if !self.core.begin_start()? {
            // Already running; the rerun request is recorded on the core.
            return Ok(());
        }
        debug!(routine = %self.core.name(), "starting routine");
        if let Err(e) = scheduler.schedule(Arc::clone(&self.core)) {
            self.core.abort_start();
            return Err(e);
        }
        Ok(())
    }

    /// Request removal from the scheduler's queue.
    ///
    /// The bound task is dropped from rotation at its next quantum boundary,
    /// not interrupted mid-quantum.
    pub fn stop(&self) {
        debug!(routine = %self.core.name(), "stop requested");
        self.core.request_stop();
    }
}

/// Explicit factory for reusable routines.
///
/// Owned by whoever composes routines (the pool orchestrator owns one);
/// there is no process-wide allocator.
pub struct RoutinePool {
    prefix: String,
    next_id: AtomicUsize,
}

impl RoutinePool {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Allocate a fresh routine with a stable name (`{prefix}-{n}`).
    pub fn allocate(&self) -> TaskRoutine {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        TaskRoutine::new(format!("{}-{}", self.prefix, id))
    }
}

impl Default for RoutinePool {
    fn default() -> Self {
        Self::new("routine")
    }
}
