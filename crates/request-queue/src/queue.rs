//! Request queue management
//!
//! This module provides the priority queue that holds inference requests from
//! submission until a terminal status, together with admission control and the
//! concurrency bound on requests in processing.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use common::error::{Error, ErrorPayload, Result};
use common::models::{
    InferencePayload, Request, RequestPriority, RequestStatus,
};
use common::types::RequestId;
use serving_config::InferenceConfig;

use crate::stats::QueueStats;

/// Heap entry for a pending request
///
/// Entries are never removed from the heap when a request leaves the pending
/// state by another route (cancel, timeout sweep). Such stale entries are
/// skipped when they reach the top.
#[derive(Debug, Clone)]
struct QueuedRequest {
    /// Request identifier
    id: RequestId,

    /// Queue priority
    priority: RequestPriority,

    /// Submission order
    sequence: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => {},
            ordering => return ordering,
        }

        // Then earlier submission first; reversed because BinaryHeap is a max-heap
        other.sequence.cmp(&self.sequence)
    }
}

/// Outcome of a cancel call on a known request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was pending and is now canceled
    Canceled,
    /// The request is being processed and cannot be canceled
    InProgress,
    /// The request had already finished with the given status
    AlreadyTerminal(RequestStatus),
}

impl CancelOutcome {
    /// Returns true if this call canceled the request
    pub fn is_canceled(&self) -> bool {
        matches!(self, CancelOutcome::Canceled)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Pending requests ordered for dequeue
    heap: BinaryHeap<QueuedRequest>,

    /// Every tracked request, pending to terminal
    requests: HashMap<RequestId, Request>,

    /// Requests currently in the processing state
    processing: HashSet<RequestId>,

    /// Number of requests in the pending state
    pending: usize,

    /// Next submission sequence number
    next_sequence: u64,

    /// Requests timed out by dequeue and not yet drained
    dequeue_timeouts: Vec<RequestId>,
}

impl QueueState {
    /// Applies a status change and keeps the pending and processing books
    fn transition(
        &mut self,
        id: &RequestId,
        status: RequestStatus,
        result: Option<serde_json::Value>,
        error: Option<ErrorPayload>,
        now: DateTime<Utc>,
    ) -> Result<RequestStatus> {
        let request = self
            .requests
            .get_mut(id)
            .ok_or(Error::RequestNotFound(*id))?;
        let previous = request.status;
        request.transition(status, result, error, now)?;

        if previous == RequestStatus::Pending {
            self.pending = self.pending.saturating_sub(1);
        }
        if status == RequestStatus::Processing {
            self.processing.insert(*id);
        } else if status.is_terminal() {
            self.processing.remove(id);
        }

        Ok(previous)
    }
}

/// Priority queue of inference requests
pub struct RequestQueue {
    /// Queue state behind a single lock
    state: Mutex<QueueState>,

    /// Maximum number of pending requests
    max_queue_size: usize,

    /// Maximum number of requests in processing
    max_concurrent_requests: usize,
}

impl RequestQueue {
    /// Creates a new request queue
    pub fn new(max_queue_size: usize, max_concurrent_requests: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_queue_size: max_queue_size.max(1),
            max_concurrent_requests: max_concurrent_requests.max(1),
        }
    }

    /// Creates a request queue sized from configuration
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(config.max_queue_size, config.max_concurrent_requests)
    }

    /// Adds a pending request
    pub fn submit(
        &self,
        payload: InferencePayload,
        priority: RequestPriority,
        timeout_seconds: Option<u64>,
    ) -> Result<RequestId> {
        let mut state = self.state.lock();

        if state.pending >= self.max_queue_size {
            warn!(
                "Rejecting request for model {}: queue is full ({} pending)",
                payload.model_id, state.pending
            );
            return Err(Error::QueueFull {
                capacity: self.max_queue_size,
            });
        }

        let request = Request::new(payload, priority, timeout_seconds);
        let id = request.id;
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        debug!(
            "Queued request {} for model {} with priority {}",
            id, request.payload.model_id, priority
        );

        state.heap.push(QueuedRequest {
            id,
            priority,
            sequence,
        });
        state.requests.insert(id, request);
        state.pending += 1;

        Ok(id)
    }

    /// Takes the next request to process
    ///
    /// Returns `None` when nothing is pending or when the number of requests in
    /// processing has reached the concurrency bound. Pending requests whose
    /// timeout elapsed while waiting are marked as timed out and skipped.
    pub fn dequeue_next(&self) -> Option<Request> {
        self.dequeue_next_at(Utc::now())
    }

    /// Takes the next request to process, as of the given time
    pub fn dequeue_next_at(&self, now: DateTime<Utc>) -> Option<Request> {
        let mut state = self.state.lock();

        if state.processing.len() >= self.max_concurrent_requests {
            return None;
        }

        while let Some(entry) = state.heap.pop() {
            let (pending, expired) = match state.requests.get(&entry.id) {
                Some(request) => (
                    request.status == RequestStatus::Pending,
                    request.queue_expired(now),
                ),
                None => (false, false),
            };

            if !pending {
                continue;
            }

            if expired {
                let error =
                    Error::Timeout("Request timed out while waiting in queue".to_string())
                        .to_payload();
                if state
                    .transition(&entry.id, RequestStatus::Timeout, None, Some(error), now)
                    .is_ok()
                {
                    info!("Request {} timed out before processing", entry.id);
                    state.dequeue_timeouts.push(entry.id);
                }
                continue;
            }

            if state
                .transition(&entry.id, RequestStatus::Processing, None, None, now)
                .is_err()
            {
                continue;
            }

            return state.requests.get(&entry.id).cloned();
        }

        None
    }

    /// Takes the requests that dequeue found expired and timed out
    ///
    /// Each id is returned once, so the caller can persist those outcomes.
    pub fn drain_dequeue_timeouts(&self) -> Vec<RequestId> {
        std::mem::take(&mut self.state.lock().dequeue_timeouts)
    }

    /// Records a status change for a request
    pub fn update_status(
        &self,
        id: &RequestId,
        status: RequestStatus,
        result: Option<serde_json::Value>,
        error: Option<ErrorPayload>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let previous = state.transition(id, status, result, error, Utc::now())?;

        debug!("Request {} moved from {} to {}", id, previous, status);

        Ok(())
    }

    /// Gets a snapshot of a request
    pub fn get_status(&self, id: &RequestId) -> Result<Request> {
        self.state
            .lock()
            .requests
            .get(id)
            .cloned()
            .ok_or(Error::RequestNotFound(*id))
    }

    /// Returns true if the request is tracked
    pub fn contains(&self, id: &RequestId) -> bool {
        self.state.lock().requests.contains_key(id)
    }

    /// Cancels a pending request
    ///
    /// Processing requests are left alone and terminal requests keep their
    /// status; both are reported through the outcome rather than as errors.
    pub fn cancel(&self, id: &RequestId) -> Result<CancelOutcome> {
        let mut state = self.state.lock();

        let status = state
            .requests
            .get(id)
            .map(|request| request.status)
            .ok_or(Error::RequestNotFound(*id))?;

        match status {
            RequestStatus::Pending => {
                state.transition(id, RequestStatus::Canceled, None, None, Utc::now())?;
                info!("Canceled request {}", id);
                Ok(CancelOutcome::Canceled)
            },
            RequestStatus::Processing => {
                debug!("Request {} is processing, not canceling", id);
                Ok(CancelOutcome::InProgress)
            },
            terminal => Ok(CancelOutcome::AlreadyTerminal(terminal)),
        }
    }

    /// Marks requests whose timeout elapsed as timed out
    pub fn sweep_timeouts(&self) -> Vec<RequestId> {
        self.sweep_timeouts_at(Utc::now())
    }

    /// Marks requests whose timeout elapsed as of the given time
    pub fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Vec<RequestId> {
        let mut state = self.state.lock();

        let expired: Vec<(RequestId, ErrorPayload)> = state
            .requests
            .values()
            .filter_map(|request| {
                if request.queue_expired(now) {
                    Some((
                        request.id,
                        Error::Timeout("Request timed out while waiting in queue".to_string())
                            .to_payload(),
                    ))
                } else if request.processing_expired(now) {
                    Some((
                        request.id,
                        Error::Timeout(format!(
                            "Request timed out after {}s of processing",
                            request.timeout_seconds.unwrap_or_default()
                        ))
                        .to_payload(),
                    ))
                } else {
                    None
                }
            })
            .collect();

        let mut timed_out = Vec::with_capacity(expired.len());
        for (id, error) in expired {
            if state
                .transition(&id, RequestStatus::Timeout, None, Some(error), now)
                .is_ok()
            {
                timed_out.push(id);
            }
        }

        if !timed_out.is_empty() {
            info!("Timed out {} requests", timed_out.len());
        }

        timed_out
    }

    /// Drops terminal requests that completed more than `max_age` ago
    pub fn purge_terminal(&self, max_age: Duration) -> usize {
        self.purge_terminal_at(Utc::now(), max_age)
    }

    /// Drops terminal requests that completed more than `max_age` before `now`
    pub fn purge_terminal_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.requests.len();

        state.requests.retain(|_, request| match request.completed_at {
            Some(completed_at) if request.is_terminal() => now - completed_at <= max_age,
            _ => true,
        });

        let removed = before - state.requests.len();
        if removed > 0 {
            info!("Removed {} expired requests", removed);
        }

        removed
    }

    /// Gets the number of pending requests
    pub fn len(&self) -> usize {
        self.state.lock().pending
    }

    /// Returns true if no request is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the number of requests in processing
    pub fn processing_count(&self) -> usize {
        self.state.lock().processing.len()
    }

    /// Gets queue statistics
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();

        let mut stats = QueueStats::empty(self.max_queue_size, self.max_concurrent_requests);
        stats.queue_length = state.pending;
        stats.processing_count = state.processing.len();
        stats.total_requests = state.requests.len();

        for request in state.requests.values() {
            *stats.status_counts.entry(request.status).or_default() += 1;
            if request.status == RequestStatus::Pending {
                *stats.priority_counts.entry(request.priority).or_default() += 1;
            }
        }

        stats
    }
}
