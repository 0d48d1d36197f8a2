//! Service adapters
//!
//! Adapters translate property prediction and generation requests, as they
//! arrive from the outer service layer, into inference manager calls. Each
//! distinct service configuration becomes one model in the shared pool.

mod adapter;
mod requestor;

pub use adapter::{
    derive_model_id, parse_priority, CancelResponse, ServiceAdapter, SubmitResponse,
};
pub use requestor::{ServiceKind, ServiceRequest, ServiceRequestor};
