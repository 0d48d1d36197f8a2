//! Queue statistics

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::models::{RequestPriority, RequestStatus};

/// Point-in-time snapshot of the request queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of pending requests
    pub queue_length: usize,

    /// Number of requests in processing
    pub processing_count: usize,

    /// Number of tracked requests, terminal ones included
    pub total_requests: usize,

    /// Tracked requests per status
    pub status_counts: BTreeMap<RequestStatus, usize>,

    /// Pending requests per priority
    pub priority_counts: BTreeMap<RequestPriority, usize>,

    /// Configured queue capacity
    pub max_queue_size: usize,

    /// Configured concurrency bound
    pub max_concurrent_requests: usize,
}

impl QueueStats {
    /// Creates stats with every status and priority counted as zero
    pub(crate) fn empty(max_queue_size: usize, max_concurrent_requests: usize) -> Self {
        Self {
            queue_length: 0,
            processing_count: 0,
            total_requests: 0,
            status_counts: RequestStatus::ALL.iter().map(|s| (*s, 0)).collect(),
            priority_counts: RequestPriority::ALL.iter().map(|p| (*p, 0)).collect(),
            max_queue_size,
            max_concurrent_requests,
        }
    }
}
