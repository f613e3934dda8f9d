use serde::{Deserialize, Serialize};

use crate::pool::MAX_POOL_THREADS;

/// Worker pool configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads. 0 = num_cpus.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Hard upper bound on pool size, guarding against unbounded thread
    /// creation.
    #[serde(default = "default_max_worker_threads")]
    pub max_worker_threads: usize,
    /// Prefix for worker thread names (`{prefix}-{index}`).
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_worker_threads() -> usize {
    0
}
fn default_max_worker_threads() -> usize {
    MAX_POOL_THREADS
}
fn default_thread_name_prefix() -> String {
    "weft-worker".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_worker_threads: default_max_worker_threads(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl PoolConfig {
    /// Resolve worker thread count (0 means use available parallelism),
    /// clamped to the configured upper bound.
    pub fn resolved_worker_threads(&self) -> usize {
        let base = if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        };
        base.min(self.max_worker_threads)
    }
}
