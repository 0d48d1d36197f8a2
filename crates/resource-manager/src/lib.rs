//! Model resource manager
//!
//! This crate keeps a bounded pool of loaded model instances. Models are
//! loaded on first demand, shared between requests, and evicted according to
//! a configurable policy when the model count or memory budget is reached.

mod eviction;
mod manager;
mod model;
mod slot;
mod stats;

pub use eviction::{
    policy_for, EvictionCandidate, EvictionPolicy, LargestSize, LeastFrequentlyUsed,
    LeastRecentlyUsed,
};
pub use manager::ModelResourceManager;
pub use model::{InferenceModel, LoadedModel, ModelLoader, ModelSpec};
pub use slot::ModelHandle;
pub use stats::{ModelUsage, PoolStats};
