//! Configuration schema
//!
//! Every field has a default, so a configuration source only needs to name
//! the knobs it changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::models::RequestPriority;
use common::types::EvictionStrategy;

/// Configuration for the asynchronous inference system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Maximum number of pending requests in the queue
    pub max_queue_size: usize,

    /// Maximum number of requests in the processing state at once
    pub max_concurrent_requests: usize,

    /// Number of worker tasks pulling from the queue
    pub max_workers: usize,

    /// Timeout applied to requests that do not specify one (None for no timeout)
    #[serde(alias = "default_request_timeout", alias = "default_timeout")]
    pub default_timeout_seconds: Option<u64>,

    /// Priority applied to requests that do not specify one
    #[serde(alias = "default_request_priority")]
    pub default_priority: RequestPriority,

    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval_ms: u64,

    /// Interval of the timeout sweep
    pub timeout_sweep_interval_ms: u64,

    /// Maximum number of models loaded at once
    pub max_models: usize,

    /// Memory budget for loaded models in MB (None for no limit)
    pub max_memory_mb: Option<f64>,

    /// Which loaded model to evict under pressure
    pub eviction_strategy: EvictionStrategy,

    /// Memory kept free below `max_memory_mb`
    pub memory_headroom_mb: f64,

    /// Size assumed for a model before it is loaded and measured
    pub default_model_size_mb: f64,

    /// How long terminal requests are retained
    pub result_ttl_hours: u64,

    /// Directory for persisted results (None keeps results in memory only)
    pub result_dir: Option<PathBuf>,

    /// Interval of the retention cleanup
    pub cleanup_interval_seconds: u64,

    /// Per-model overrides, keyed by model identifier
    pub model_specific_settings: HashMap<String, ModelSettings>,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_concurrent_requests: 4,
            max_workers: 4,
            default_timeout_seconds: None,
            default_priority: RequestPriority::Normal,
            poll_interval_ms: 100,
            timeout_sweep_interval_ms: 1000,
            max_models: 5,
            max_memory_mb: None,
            eviction_strategy: EvictionStrategy::Lru,
            memory_headroom_mb: 1000.0,
            default_model_size_mb: 500.0,
            result_ttl_hours: 24,
            result_dir: None,
            cleanup_interval_seconds: 3600,
            model_specific_settings: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl InferenceConfig {
    /// Worker idle poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout sweep interval
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    /// Retention cleanup interval
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Retention period for terminal requests
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_hours.saturating_mul(3600))
    }

    /// Memory budget once the headroom is taken off
    pub fn effective_memory_limit_mb(&self) -> Option<f64> {
        self.max_memory_mb
            .map(|max| (max - self.memory_headroom_mb).max(0.0))
    }

    /// Overrides for one model, if any
    pub fn model_settings(&self, model_id: &str) -> Option<&ModelSettings> {
        self.model_specific_settings.get(model_id)
    }
}

/// Per-model overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Declared size of the model in MB
    pub estimated_size_mb: Option<f64>,

    /// Timeout for requests against this model
    pub timeout_seconds: Option<u64>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Whether to print the event target
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InferenceConfig::default();
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_models, 5);
        assert_eq!(config.eviction_strategy, EvictionStrategy::Lru);
        assert_eq!(config.result_ttl(), Duration::from_secs(24 * 3600));
        assert!(config.effective_memory_limit_mb().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: InferenceConfig = serde_json::from_str(
            r#"{
                "max_workers": 2,
                "eviction_strategy": "largest_size",
                "default_request_priority": "high",
                "max_memory_mb": 4000,
                "model_specific_settings": {"esol": {"estimated_size_mb": 120}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.eviction_strategy, EvictionStrategy::Size);
        assert_eq!(config.default_priority, RequestPriority::High);
        assert_eq!(config.effective_memory_limit_mb(), Some(3000.0));
        assert_eq!(
            config.model_settings("esol").and_then(|s| s.estimated_size_mb),
            Some(120.0)
        );
    }

    #[test]
    fn test_priority_names_ignore_case() {
        let config: InferenceConfig =
            serde_json::from_str(r#"{"default_priority": "HIGH"}"#).unwrap();
        assert_eq!(config.default_priority, RequestPriority::High);

        let config: InferenceConfig =
            serde_json::from_str(r#"{"default_request_priority": "Critical"}"#).unwrap();
        assert_eq!(config.default_priority, RequestPriority::Critical);
    }
}
