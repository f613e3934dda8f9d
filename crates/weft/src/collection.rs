use tracing::trace;

use crate::error::TaskError;
use crate::task::{Resume, Task};

type CompletionFn = Box<dyn FnMut() + Send>;

/// A cooperative task that multiplexes a set of child tasks round-robin on
/// a single resume call, completing only when all children are done.
///
/// Each resume gives every still-active child exactly one quantum, in
/// insertion order, regardless of how much work any single child does per
/// quantum. Cross-child completion order is undetermined: a fast child may
/// finish before a slow one added earlier.
///
/// The collection is itself a [`Task`], so it can be bound to a routine or
/// nested inside another collection.
#[derive(Default)]
pub struct ParallelTaskCollection {
    pending: Vec<Box<dyn Task>>,
    active: Vec<Box<dyn Task>>,
    running: bool,
    on_complete: Vec<CompletionFn>,
}

impl ParallelTaskCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a child task to the pending list.
    ///
    /// Children may only be added while the collection is not running;
    /// adding mid-batch is a usage error and leaves the list untouched.
    pub fn add(&mut self, task: Box<dyn Task>) -> Result<(), TaskError> {
        if self.running {
            return Err(TaskError::CollectionRunning);
        }
        self.pending.push(task);
        Ok(())
    }

    /// Subscribe to batch completion.
    ///
    /// Subscribers run synchronously on whichever thread drives the
    /// completing resume — for a collection bound to a pool slot, that is
    /// the slot's worker thread.
    pub fn on_complete(&mut self, subscriber: impl FnMut() + Send + 'static) {
        self.on_complete.push(Box::new(subscriber));
    }

    /// Intentionally a no-op: children already snapshotted into the active
    /// set run to completion, and the pending list is left for the next
    /// batch.
    pub fn clear(&mut self) {}

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Children added but not yet snapshotted into a batch.
    pub fn pending_tasks(&self) -> usize {
        self.pending.len()
    }

    /// Children in the current batch still holding work.
    pub fn active_tasks(&self) -> usize {
        self.active.len()
    }

    fn fire_complete(&mut self) {
        for subscriber in &mut self.on_complete {
            subscriber();
        }
    }
}

impl Task for ParallelTaskCollection {
    fn resume(&mut self) -> Result<Resume, TaskError> {
        if !self.running {
            if self.pending.is_empty() && self.active.is_empty() {
                // A trivial batch: nothing to run still signals completion,
                // so a pool slot reused without new work joins its batch.
                self.fire_complete();
                return Ok(Resume::Done);
            }
            self.active.append(&mut self.pending);
            self.running = true;
            trace!(children = self.active.len(), "batch started");
        }

        // One quantum per still-active child, insertion order.
        let mut i = 0;
        while i < self.active.len() {
            match self.active[i].resume() {
                Ok(Resume::More) => i += 1,
                Ok(Resume::Done) => {
                    self.active.remove(i);
                }
                Err(e) => {
                    // The faulted child leaves the batch; the error reaches
                    // whatever drives this collection.
                    self.active.remove(i);
                    return Err(e);
                }
            }
        }

        if self.active.is_empty() {
            self.running = false;
            trace!("batch complete");
            self.fire_complete();
            return Ok(Resume::Done);
        }
        Ok(Resume::More)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::task;

    fn spin_task(quanta: usize) -> (Box<dyn Task>, Arc<AtomicUsize>) {
        let total = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&total);
        let mut left = quanta;
        let task = task::from_fn(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            left -= 1;
            if left == 0 {
                left = quanta;
                Ok(Resume::Done)
            } else {
                Ok(Resume::More)
            }
        });
        (Box::new(task), total)
    }

    #[test]
    fn gives_each_child_one_quantum_per_cycle() {
        let mut collection = ParallelTaskCollection::new();
        let (a, count_a) = spin_task(1);
        let (b, count_b) = spin_task(2);
        let (c, count_c) = spin_task(3);
        collection.add(a).unwrap();
        collection.add(b).unwrap();
        collection.add(c).unwrap();

        assert_eq!(collection.resume().unwrap(), Resume::More);
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(count_c.load(Ordering::SeqCst), 1);
        assert_eq!(collection.active_tasks(), 2);

        assert_eq!(collection.resume().unwrap(), Resume::More);
        assert_eq!(collection.resume().unwrap(), Resume::Done);
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
        assert_eq!(count_c.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn resumes_children_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut collection = ParallelTaskCollection::new();
        for id in 0..3 {
            let log = Arc::clone(&log);
            collection
                .add(Box::new(task::from_fn(move || {
                    log.lock().unwrap().push(id);
                    Ok(Resume::Done)
                })))
                .unwrap();
        }

        assert_eq!(collection.resume().unwrap(), Resume::Done);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn add_while_running_fails_without_mutating() {
        let mut collection = ParallelTaskCollection::new();
        let (task, _) = spin_task(2);
        collection.add(task).unwrap();

        assert_eq!(collection.resume().unwrap(), Resume::More);
        assert!(collection.is_running());

        let (late, _) = spin_task(1);
        assert!(matches!(collection.add(late), Err(TaskError::CollectionRunning)));
        assert_eq!(collection.pending_tasks(), 0);

        assert_eq!(collection.resume().unwrap(), Resume::Done);
    }

    #[test]
    fn completion_event_fires_once_per_batch() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut collection = ParallelTaskCollection::new();
        let seen = Arc::clone(&fired);
        collection.on_complete(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let (task, _) = spin_task(3);
        collection.add(task).unwrap();
        while collection.resume().unwrap() == Resume::More {}
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The collection is reusable for a second batch.
        let (task, _) = spin_task(1);
        collection.add(task).unwrap();
        assert_eq!(collection.resume().unwrap(), Resume::Done);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn idle_empty_collection_completes_trivially() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut collection = ParallelTaskCollection::new();
        let seen = Arc::clone(&fired);
        collection.on_complete(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(collection.resume().unwrap(), Resume::Done);
        assert!(!collection.is_running());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // Flags the documented behavior: clear() cancels nothing.
    #[test]
    fn clear_does_not_cancel_active_children() {
        let mut collection = ParallelTaskCollection::new();
        let (task, count) = spin_task(3);
        collection.add(task).unwrap();

        assert_eq!(collection.resume().unwrap(), Resume::More);
        collection.clear();
        assert_eq!(collection.resume().unwrap(), Resume::More);
        assert_eq!(collection.resume().unwrap(), Resume::Done);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn child_fault_propagates_unmasked() {
        let mut collection = ParallelTaskCollection::new();
        collection
            .add(Box::new(task::from_fn(|| {
                Err(TaskError::Failed("boom".into()))
            })))
            .unwrap();

        assert!(matches!(collection.resume(), Err(TaskError::Failed(_))));
    }

    #[test]
    fn faulted_child_leaves_siblings_active() {
        let mut collection = ParallelTaskCollection::new();
        collection
            .add(Box::new(task::from_fn(|| {
                Err(TaskError::Failed("boom".into()))
            })))
            .unwrap();
        let (healthy, count) = spin_task(2);
        collection.add(healthy).unwrap();

        assert!(collection.resume().is_err());
        assert_eq!(collection.active_tasks(), 1);

        // Driving past the fault finishes the surviving child.
        assert_eq!(collection.resume().unwrap(), Resume::More);
        assert_eq!(collection.resume().unwrap(), Resume::Done);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
