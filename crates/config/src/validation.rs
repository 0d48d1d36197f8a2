//! Configuration validation

use common::error::{Error, Result};

use crate::schema::InferenceConfig;

impl InferenceConfig {
    /// Checks value ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        require(self.max_queue_size >= 1, "max_queue_size must be at least 1")?;
        require(
            self.max_concurrent_requests >= 1,
            "max_concurrent_requests must be at least 1",
        )?;
        require(self.max_workers >= 1, "max_workers must be at least 1")?;
        require(self.max_models >= 1, "max_models must be at least 1")?;
        require(self.poll_interval_ms >= 1, "poll_interval_ms must be at least 1")?;
        require(
            self.timeout_sweep_interval_ms >= 1,
            "timeout_sweep_interval_ms must be at least 1",
        )?;
        require(self.result_ttl_hours >= 1, "result_ttl_hours must be at least 1")?;
        require(
            self.cleanup_interval_seconds >= 60,
            "cleanup_interval_seconds must be at least 60",
        )?;
        require(
            self.memory_headroom_mb >= 0.0,
            "memory_headroom_mb must not be negative",
        )?;
        require(
            self.default_model_size_mb > 0.0,
            "default_model_size_mb must be positive",
        )?;

        if let Some(max_memory) = self.max_memory_mb {
            require(max_memory > 0.0, "max_memory_mb must be positive")?;
            if self.memory_headroom_mb >= max_memory {
                return Err(Error::Config(format!(
                    "memory_headroom_mb ({}) must be below max_memory_mb ({})",
                    self.memory_headroom_mb, max_memory
                )));
            }
        }

        if self.default_timeout_seconds == Some(0) {
            return Err(Error::Config(
                "default_timeout_seconds must be positive when set".to_string(),
            ));
        }

        for (model_id, settings) in &self.model_specific_settings {
            if let Some(size) = settings.estimated_size_mb {
                if size <= 0.0 {
                    return Err(Error::Config(format!(
                        "estimated_size_mb for model {} must be positive",
                        model_id
                    )));
                }
            }
        }

        Ok(())
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message.to_string()))
    }
}
