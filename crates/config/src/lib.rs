//! Configuration management for the modelserve inference core
//!
//! This crate defines every numeric and policy knob of the queue, the model
//! pool and the inference manager, and loads them from defaults, an optional
//! file and the environment.

pub mod manager;
pub mod schema;
pub mod validation;

// Re-export commonly used types
pub use manager::{ConfigManager, ENV_PREFIX};
pub use schema::{InferenceConfig, LogFormat, LoggingConfig, ModelSettings};
