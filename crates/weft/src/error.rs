use thiserror::Error;

/// Error type for the task scheduling engine.
///
/// Usage errors (adding to a running collection, rebinding a running
/// routine, scheduling onto a stopped runner) indicate a race or ordering
/// bug in composing code and are signaled immediately rather than retried.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("can't add tasks to a collection while it is running")]
    CollectionRunning,

    #[error("routine is running; stop it before rebinding")]
    RoutineRunning,

    #[error("routine has no task bound")]
    MissingTask,

    #[error("routine has no scheduler bound")]
    MissingScheduler,

    #[error("runner is stopped and can't accept new routines")]
    RunnerStopped,

    #[error("worker pool needs at least one thread")]
    EmptyPool,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
