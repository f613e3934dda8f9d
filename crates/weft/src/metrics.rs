use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Operational counters for a single runner.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerMetrics {
    /// Total resume quanta executed.
    pub quanta_executed: u64,
    /// Routines that ran their bound task to completion.
    pub tasks_completed: u64,
    /// Routines removed from rotation by a stop request.
    pub tasks_stopped: u64,
    /// Routines dropped because their task faulted.
    pub tasks_faulted: u64,
    /// Rolling average quantum duration.
    pub avg_quantum: Duration,
    /// Last time a routine completed on this runner.
    pub last_completed: Option<DateTime<Utc>>,
}

impl RunnerMetrics {
    /// Record one executed quantum.
    pub fn record_quantum(&mut self, duration: Duration) {
        self.quanta_executed += 1;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if self.quanta_executed == 1 {
            duration
        } else {
            let prev_nanos = self.avg_quantum.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.quanta_executed as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_quantum = new_avg;
    }

    /// Record a routine completing its task.
    pub fn record_completion(&mut self) {
        self.tasks_completed += 1;
        self.last_completed = Some(Utc::now());
    }

    /// Record a routine removed by a stop request.
    pub fn record_stop(&mut self) {
        self.tasks_stopped += 1;
    }

    /// Record a routine dropped on a task fault.
    pub fn record_fault(&mut self) {
        self.tasks_faulted += 1;
    }

    /// Fold another runner's metrics into this one (pool aggregation).
    pub fn merge(&mut self, other: &RunnerMetrics) {
        let total = self.quanta_executed + other.quanta_executed;
        if total > 0 {
            let self_nanos = self.avg_quantum.as_nanos() as f64 * self.quanta_executed as f64;
            let other_nanos = other.avg_quantum.as_nanos() as f64 * other.quanta_executed as f64;
            self.avg_quantum = Duration::from_nanos(((self_nanos + other_nanos) / total as f64) as u64);
        }
        self.quanta_executed = total;
        self.tasks_completed += other.tasks_completed;
        self.tasks_stopped += other.tasks_stopped;
        self.tasks_faulted += other.tasks_faulted;
        self.last_completed = match (self.last_completed, other.last_completed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}
