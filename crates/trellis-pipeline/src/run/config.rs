//! Run configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Worker count for batch execution. Batches of one node run in
    /// parallel only when this is two or more; nodes themselves always
    /// execute strictly in topological order.
    pub workers: usize,
}

impl RunConfig {
    /// Creates a single-threaded configuration.
    pub fn new() -> Self {
        Self { workers: 1 }
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Whether batches may be dispatched in parallel.
    pub fn parallel_enabled(&self) -> bool {
        self.workers >= 2
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new()
    }
}
