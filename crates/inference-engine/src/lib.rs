//! Asynchronous inference execution
//!
//! This crate ties the request queue and the model resource manager together:
//! a pool of workers pulls requests by priority, borrows a loaded model, runs
//! the inference call under the request's timeout budget and records the
//! outcome. Background tasks sweep timeouts and purge expired results.

mod manager;
mod registry;
mod stats;
mod store;
mod worker;

pub use manager::InferenceManager;
pub use registry::ModelRegistry;
pub use stats::{InferenceStats, WorkerStats};
pub use store::ResultStore;

pub use request_queue::{CancelOutcome, QueueStats};
pub use resource_manager::{
    InferenceModel, LoadedModel, ModelHandle, ModelLoader, ModelSpec, PoolStats,
};
