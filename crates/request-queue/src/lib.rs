//! Request queue for asynchronous inference
//!
//! This crate provides the priority-ordered store of inference requests:
//! admission control, dequeue by priority, status tracking, cancellation,
//! timeout sweeps and retention cleanup.

mod queue;
mod stats;

pub use queue::{CancelOutcome, RequestQueue};
pub use stats::QueueStats;
