//! Inference manager statistics

use serde::{Deserialize, Serialize};

use request_queue::QueueStats;
use resource_manager::PoolStats;

/// Worker pool state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Configured number of workers
    pub max_workers: usize,

    /// Workers currently running
    pub running: usize,

    /// Workers currently handling a request
    pub busy: usize,
}

/// Combined snapshot of the queue, the model pool and the workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceStats {
    pub queue: QueueStats,
    pub models: PoolStats,
    pub workers: WorkerStats,
}
