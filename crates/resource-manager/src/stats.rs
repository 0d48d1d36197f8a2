//! Pool statistics

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::types::{EvictionStrategy, ModelId};

/// Usage metadata of one model slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Accounted size in MB (the estimate while loading)
    pub size_mb: f64,

    /// When loading finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time: Option<DateTime<Utc>>,

    /// When the model was last handed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,

    /// Number of times the model was handed out
    pub use_count: u64,

    /// Inference calls currently holding the model
    pub active: usize,

    /// Whether the model is being loaded
    pub is_loading: bool,
}

/// Point-in-time snapshot of the model pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of loaded models
    pub loaded_models: usize,

    /// Number of models being loaded
    pub loading_models: usize,

    /// Memory accounted to loaded and loading models in MB
    pub total_memory_mb: f64,

    /// Per-model metadata
    pub models: BTreeMap<ModelId, ModelUsage>,

    /// Configured model limit
    pub max_models: usize,

    /// Configured memory limit in MB
    pub max_memory_mb: Option<f64>,

    /// Configured memory headroom in MB
    pub memory_headroom_mb: f64,

    /// Configured eviction strategy
    pub eviction_strategy: EvictionStrategy,
}
