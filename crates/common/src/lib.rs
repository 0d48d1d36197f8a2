//! Common types for the modelserve inference core
//!
//! This crate provides the pieces shared by every other crate in the workspace:
//! the error type, identifiers, and the request data model.

pub mod error;
pub mod models;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorKind, ErrorPayload, Result};
pub use models::*;
pub use types::*;
