use std::sync::{Arc, Mutex};

use crate::error::TaskError;

/// Outcome of a single resume quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The task did a bounded slice of work and needs further resumption.
    More,
    /// The task finished; it must not be resumed again without a restart.
    Done,
}

/// Lifecycle of a task as observed by the routine driving it.
///
/// `resume` is only ever issued from `Ready` or `Suspended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Bound and waiting for its first quantum (or restarted).
    Ready,
    /// Yielded mid-computation; will be resumed again.
    Suspended,
    /// Reported [`Resume::Done`].
    Completed,
    /// A resume returned an error; the task is out of rotation.
    Faulted,
}

/// A computation that can be resumed repeatedly, each resume doing a
/// bounded slice of work and reporting whether more work remains.
///
/// Exactly one runner drives a given task at any instant; suspension only
/// happens between `resume` calls, never inside one. Results are the task's
/// own concern (closure state, shared handles) — the scheduler moves no
/// data. Sub-delegation is plain composition: a task that owns children
/// resumes them inside its own `resume`, as the collection types do.
pub trait Task: Send {
    /// Advance by one scheduling quantum.
    ///
    /// Errors are never swallowed by the scheduling machinery; they
    /// propagate to whatever is driving this task.
    fn resume(&mut self) -> Result<Resume, TaskError>;
}

impl<T: Task + ?Sized> Task for Box<T> {
    fn resume(&mut self) -> Result<Resume, TaskError> {
        (**self).resume()
    }
}

/// A task shared between the thread that configures it and the thread that
/// drives it. The lock is held only for the duration of one quantum.
impl<T: Task + ?Sized> Task for Arc<Mutex<T>> {
    fn resume(&mut self) -> Result<Resume, TaskError> {
        self.lock()
            .map_err(|e| TaskError::LockPoisoned(format!("shared task lock: {e}")))?
            .resume()
    }
}

/// Adapt a closure into a [`Task`].
pub fn from_fn<F>(f: F) -> FnTask<F>
where
    F: FnMut() -> Result<Resume, TaskError> + Send,
{
    FnTask(f)
}

/// See [`from_fn`].
pub struct FnTask<F>(F);

impl<F> Task for FnTask<F>
where
    F: FnMut() -> Result<Resume, TaskError> + Send,
{
    fn resume(&mut self) -> Result<Resume, TaskError> {
        (self.0)()
    }
}
