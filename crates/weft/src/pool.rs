use std::cmp;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace};

use crate::collection::ParallelTaskCollection;
use crate::config::PoolConfig;
use crate::error::TaskError;
use crate::metrics::RunnerMetrics;
use crate::routine::{RoutinePool, TaskRoutine};
use crate::runner::{Scheduler, ThreadRunner};
use crate::task::{Resume, Task};

/// Hard upper bound on pool size, guarding against unbounded thread
/// creation.
pub const MAX_POOL_THREADS: usize = 1024;

type CompletionFn = Box<dyn FnMut() + Send>;

/// Fans submitted tasks out across a fixed pool of dedicated-thread runners
/// and joins on their completion without ever blocking.
///
/// Each pool slot is a (runner, routine, collection) triple created once at
/// construction and reused for the orchestrator's lifetime. Work assigned to
/// the same slot interleaves cooperatively on that slot's thread; true
/// parallelism exists only across slots. Distribution is round-robin by
/// modulo index, not by load: a slot that finishes early receives no extra
/// work until the next resume cycle distributes newly pending items. That
/// trades load balance for simplicity and is a documented limitation.
///
/// The orchestrator is itself a [`Task`]: `resume` reports [`Resume::More`]
/// until every slot has signaled completion through an atomic counter, so it
/// can be driven by a single-threaded runner or nested inside another
/// collection without stalling the driver.
pub struct MultiThreadParallelTaskCollection {
    runners: Vec<Arc<ThreadRunner>>,
    routines: Vec<TaskRoutine>,
    slots: Vec<Arc<Mutex<ParallelTaskCollection>>>,
    pending: Vec<Box<dyn Task>>,
    counter: Arc<AtomicIsize>,
    /// Pool members in use; also the counter's reset value after a batch.
    concurrent: usize,
    running: bool,
    on_complete: Vec<CompletionFn>,
}

impl MultiThreadParallelTaskCollection {
    /// Build a pool of `number_of_threads` slots. Errors on zero; sizes
    /// above [`MAX_POOL_THREADS`] are clamped. No OS thread exists until a
    /// slot first receives work.
    pub fn new(number_of_threads: usize) -> Result<Self, TaskError> {
        Self::with_prefix(number_of_threads, "weft-worker")
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, TaskError> {
        Self::with_prefix(config.resolved_worker_threads(), &config.thread_name_prefix)
    }

    fn with_prefix(number_of_threads: usize, prefix: &str) -> Result<Self, TaskError> {
        if number_of_threads == 0 {
            return Err(TaskError::EmptyPool);
        }
        let size = cmp::min(number_of_threads, MAX_POOL_THREADS);

        let counter = Arc::new(AtomicIsize::new(0));
        let routine_pool = RoutinePool::new(format!("{prefix}-routine"));
        let mut runners = Vec::with_capacity(size);
        let mut routines = Vec::with_capacity(size);
        let mut slots = Vec::with_capacity(size);

        for i in 0..size {
            let runner = Arc::new(ThreadRunner::new(format!("{prefix}-{i}")));

            let mut collection = ParallelTaskCollection::new();
            let slot_counter = Arc::clone(&counter);
            collection.on_complete(move || {
                // Release pairs with the orchestrator's acquire read, so the
                // batch's writes are visible once the counter reads zero.
                slot_counter.fetch_sub(1, Ordering::AcqRel);
            });
            let slot = Arc::new(Mutex::new(collection));

            let mut routine = routine_pool.allocate();
            routine.set_task(Box::new(Arc::clone(&slot)))?;
            routine.set_scheduler(Arc::clone(&runner) as Arc<dyn Scheduler>)?;

            runners.push(runner);
            routines.push(routine);
            slots.push(slot);
        }

        info!(pool_size = size, "parallel task pool created");
        Ok(Self {
            runners,
            routines,
            slots,
            pending: Vec::new(),
            counter,
            concurrent: 0,
            running: false,
            on_complete: Vec::new(),
        })
    }

    /// Append a task to the pending list for the next distribution cycle.
    ///
    /// Errors while a batch is running, without mutating the list.
    pub fn add(&mut self, task: Box<dyn Task>) -> Result<(), TaskError> {
        if self.running {
            return Err(TaskError::CollectionRunning);
        }
        self.pending.push(task);
        Ok(())
    }

    /// Subscribe to batch completion. Subscribers run on the orchestrator's
    /// driving thread, inside the resume that observes the join.
    pub fn on_complete(&mut self, subscriber: impl FnMut() + Send + 'static) {
        self.on_complete.push(Box::new(subscriber));
    }

    /// Number of pool slots.
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Pool members whose local batch has not yet completed.
    pub fn outstanding(&self) -> isize {
        self.counter.load(Ordering::Acquire)
    }

    /// Worker threads currently live.
    pub fn started_threads(&self) -> usize {
        self.runners.iter().filter(|r| r.is_running()).count()
    }

    /// Metrics aggregated across all pool runners.
    pub fn metrics(&self) -> RunnerMetrics {
        let mut total = RunnerMetrics::default();
        for runner in &self.runners {
            total.merge(&runner.metrics());
        }
        total
    }

    /// Stop and join every pool runner. Also performed on drop.
    pub fn stop(&mut self) {
        for runner in &self.runners {
            runner.stop();
        }
    }

    fn distribute_pending(&mut self) -> Result<(), TaskError> {
        let n = self.pending.len();
        let pool_size = self.slots.len();
        for (i, task) in self.pending.drain(..).enumerate() {
            let slot_index = (self.concurrent + i) % pool_size;
            let mut slot = self.slots[slot_index]
                .lock()
                .map_err(|e| TaskError::LockPoisoned(format!("pool slot lock: {e}")))?;
            slot.add(task)?;
            trace!(item = i, slot = slot_index, "task assigned");
        }
        self.concurrent = cmp::min(pool_size, self.concurrent + n);
        // Visible to the worker decrements before any routine starts.
        self.counter.store(self.concurrent as isize, Ordering::Release);
        debug!(
            items = n,
            in_use = self.concurrent,
            "distributed batch across pool"
        );
        Ok(())
    }
}

impl Task for MultiThreadParallelTaskCollection {
    /// Drive the orchestration for one cycle.
    ///
    /// Distributes any pending items, (re)starts the in-use routines, then
    /// polls the join counter. Never blocks: absence of progress is reported
    /// as [`Resume::More`], leaving the caller free to resume again later.
    fn resume(&mut self) -> Result<Resume, TaskError> {
        if !self.running {
            if !self.pending.is_empty() {
                self.distribute_pending()?;
            }
            for routine in &self.routines[..self.concurrent] {
                routine.start()?;
            }
        }

        // Acquire pairs with the release decrement in each slot's completion
        // subscriber; the counter alone is what this barrier protects.
        self.running = self.counter.load(Ordering::Acquire) > 0;
        if self.running {
            return Ok(Resume::More);
        }

        for subscriber in &mut self.on_complete {
            subscriber();
        }
        self.counter
            .store(self.concurrent as isize, Ordering::Release);
        Ok(Resume::Done)
    }
}

impl Drop for MultiThreadParallelTaskCollection {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::routine::TaskRoutine;
    use crate::runner::TickRunner;
    use crate::task::{self, TaskState};

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

    /// Task recording the worker thread it runs on.
    fn record_thread_task(id: usize, log: Arc<Mutex<HashMap<usize, String>>>) -> Box<dyn Task> {
        Box::new(task::from_fn(move || {
            let thread = std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string();
            log.lock().unwrap().insert(id, thread);
            Ok(Resume::Done)
        }))
    }

    fn drive(pool: &mut MultiThreadParallelTaskCollection) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match pool.resume().unwrap() {
                Resume::Done => return,
                Resume::More => {
                    if Instant::now() > deadline {
                        panic!("pool did not complete in time");
                    }
                    std::thread::sleep(Duration::from_micros(500));
                }
            }
        }
    }

    #[test]
    fn zero_size_pool_is_rejected() {
        assert!(matches!(
            MultiThreadParallelTaskCollection::new(0),
            Err(TaskError::EmptyPool)
        ));
    }

    #[test]
    fn oversized_pool_clamps_to_cap() {
        let pool = MultiThreadParallelTaskCollection::new(MAX_POOL_THREADS + 1).unwrap();
        assert_eq!(pool.pool_size(), MAX_POOL_THREADS);
    }

    #[test]
    fn empty_pool_completes_without_starting_threads() {
        let mut pool = MultiThreadParallelTaskCollection::new(MAX_POOL_THREADS).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        pool.on_complete(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(pool.resume().unwrap(), Resume::Done);
        assert_eq!(pool.started_threads(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn three_tasks_over_two_workers_distribute_round_robin() {
        let log = Arc::new(Mutex::new(HashMap::new()));
        let mut pool = MultiThreadParallelTaskCollection::new(2).unwrap();

        let counter = Arc::clone(&pool.counter);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        pool.on_complete(move || {
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        for id in 0..3 {
            pool.add(record_thread_task(id, Arc::clone(&log))).unwrap();
        }
        drive(&mut pool);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let log = log.lock().unwrap();
        // Item i lands in slot i % 2: slot 0 gets {0, 2}, slot 1 gets {1}.
        assert_eq!(log[&0], "weft-worker-0");
        assert_eq!(log[&1], "weft-worker-1");
        assert_eq!(log[&2], "weft-worker-0");
    }

    #[test]
    fn add_while_running_fails() {
        let mut pool = MultiThreadParallelTaskCollection::new(2).unwrap();
        // The task can't finish until the gate opens, so the batch is
        // reliably still running when the late add happens.
        let gate = Arc::new(AtomicUsize::new(0));
        let open = Arc::clone(&gate);
        pool.add(Box::new(task::from_fn(move || {
            if open.load(Ordering::SeqCst) == 0 {
                Ok(Resume::More)
            } else {
                Ok(Resume::Done)
            }
        })))
        .unwrap();

        assert_eq!(pool.resume().unwrap(), Resume::More);
        let (late, _) = spin_task(1);
        assert!(matches!(pool.add(late), Err(TaskError::CollectionRunning)));

        gate.store(1, Ordering::SeqCst);
        drive(&mut pool);
    }

    #[test]
    fn four_tasks_run_concurrently_across_four_workers() {
        let mut pool = MultiThreadParallelTaskCollection::new(4).unwrap();
        let rendezvous = Arc::new(Barrier::new(4));
        let names = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..4 {
            let rendezvous = Arc::clone(&rendezvous);
            let names = Arc::clone(&names);
            pool.add(Box::new(task::from_fn(move || {
                // Only passes if all four workers reach this quantum at the
                // same time on their own threads.
                rendezvous.wait();
                let thread = std::thread::current()
                    .name()
                    .unwrap_or("unnamed")
                    .to_string();
                names.lock().unwrap().push(thread);
                Ok(Resume::Done)
            })))
            .unwrap();
        }

        drive(&mut pool);
        let names = names.lock().unwrap();
        let distinct: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn completes_only_after_slowest_task() {
        let mut pool = MultiThreadParallelTaskCollection::new(4).unwrap();
        let mut counts = Vec::new();
        for quanta in [1, 1, 1, 30] {
            let (task, count) = spin_task(quanta);
            pool.add(task).unwrap();
            counts.push((quanta, count));
        }

        drive(&mut pool);
        for (quanta, count) in counts {
            assert_eq!(count.load(Ordering::SeqCst), quanta);
        }
        // After the join, the counter is reset to the in-use slot count.
        assert_eq!(pool.outstanding(), 4);
    }

    #[test]
    fn second_batch_offsets_distribution_by_prior_count() {
        let mut pool = MultiThreadParallelTaskCollection::new(2).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        pool.on_complete(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let log = Arc::new(Mutex::new(HashMap::new()));
        for id in 0..3 {
            pool.add(record_thread_task(id, Arc::clone(&log))).unwrap();
        }
        drive(&mut pool);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Prior assigned count is 2 (both slots in use), so the second
        // batch starts over at slot (2 + 0) % 2 = 0.
        let log2 = Arc::new(Mutex::new(HashMap::new()));
        for id in 0..2 {
            pool.add(record_thread_task(id, Arc::clone(&log2))).unwrap();
        }
        drive(&mut pool);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let log2 = log2.lock().unwrap();
        assert_eq!(log2[&0], "weft-worker-0");
        assert_eq!(log2[&1], "weft-worker-1");
    }

    #[test]
    fn nests_inside_a_host_driven_runner() {
        let mut pool = MultiThreadParallelTaskCollection::new(2).unwrap();
        let mut counts = Vec::new();
        for _ in 0..4 {
            let (task, count) = spin_task(3);
            pool.add(task).unwrap();
            counts.push(count);
        }

        let runner = Arc::new(TickRunner::new());
        let mut routine = TaskRoutine::new("orchestrator");
        routine
            .set_task(Box::new(pool))
            .unwrap()
            .set_scheduler(Arc::clone(&runner) as Arc<dyn Scheduler>)
            .unwrap();
        routine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while runner.tick() > 0 {
            if Instant::now() > deadline {
                panic!("nested pool did not complete in time");
            }
            std::thread::sleep(Duration::from_micros(500));
        }

        assert_eq!(routine.state(), TaskState::Completed);
        for count in counts {
            assert_eq!(count.load(Ordering::SeqCst), 3);
        }
    }
}
