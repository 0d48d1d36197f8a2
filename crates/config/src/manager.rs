//! Configuration loading
//!
//! Sources are layered with the `config` crate: built-in defaults, then an
//! optional file (JSON, YAML or TOML, chosen by extension), then environment
//! variables. The prefix is joined with a single underscore and nested keys
//! use a double underscore, e.g. `MODELSERVE_MAX_WORKERS=8` or
//! `MODELSERVE_LOGGING__FORMAT=json`.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use common::error::{Error, Result};

use crate::schema::InferenceConfig;

/// Prefix of the environment variables read by [`ConfigManager`]
pub const ENV_PREFIX: &str = "MODELSERVE";

/// Loaded and validated configuration
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Effective configuration
    config: InferenceConfig,

    /// File the configuration was read from, if any
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a configuration manager from defaults and the environment
    pub fn new() -> Result<Self> {
        Self::load(None, ENV_PREFIX)
    }

    /// Creates a configuration manager from a file, with environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()), ENV_PREFIX)
    }

    /// Wraps an already built configuration after validating it
    pub fn from_config(config: InferenceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source: None,
        })
    }

    /// Loads configuration from an optional file and the given environment prefix
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            debug!("Reading configuration file {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to read configuration: {}", e)))?;

        let config: InferenceConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;

        info!(
            "Configuration loaded: {} workers, queue size {}, {} models max, eviction {}",
            config.max_workers,
            config.max_queue_size,
            config.max_models,
            config.eviction_strategy
        );

        Ok(Self {
            config,
            source: path.map(Path::to_path_buf),
        })
    }

    /// Gets the effective configuration
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Gets the file the configuration came from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Consumes the manager, returning the configuration
    pub fn into_config(self) -> InferenceConfig {
        self.config
    }
}
