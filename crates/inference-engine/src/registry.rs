//! Model registry
//!
//! The registry maps model identifiers to the [`ModelSpec`] used to load them.
//! Per-model configuration is resolved once, when a model is registered.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use common::types::ModelId;
use serving_config::{InferenceConfig, ModelSettings};
use resource_manager::{ModelLoader, ModelSpec};

/// Registry of loadable models
pub struct ModelRegistry {
    /// Registered models
    models: DashMap<ModelId, ModelSpec>,

    /// Size assumed for models without a declared size
    default_size_mb: f64,

    /// Per-model overrides, keyed by model identifier
    settings: HashMap<String, ModelSettings>,
}

impl ModelRegistry {
    /// Creates an empty registry with default sizing
    pub fn new() -> Self {
        Self::from_config(&InferenceConfig::default())
    }

    /// Creates an empty registry using the sizing and overrides of a configuration
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            models: DashMap::new(),
            default_size_mb: config.default_model_size_mb,
            settings: config.model_specific_settings.clone(),
        }
    }

    /// Builds the spec for a model, applying its configured overrides
    pub fn resolve(&self, model_id: ModelId, loader: Arc<dyn ModelLoader>) -> ModelSpec {
        let settings = self.settings.get(model_id.as_str());
        let size_mb = settings
            .and_then(|s| s.estimated_size_mb)
            .unwrap_or(self.default_size_mb);
        let timeout = settings.and_then(|s| s.timeout_seconds);

        ModelSpec::new(model_id, size_mb, loader).with_timeout(timeout)
    }

    /// Registers a model, replacing any previous registration
    pub fn register(&self, model_id: impl Into<ModelId>, loader: Arc<dyn ModelLoader>) -> ModelSpec {
        let spec = self.resolve(model_id.into(), loader);
        self.register_spec(spec.clone());
        spec
    }

    /// Registers a fully built spec as is
    pub fn register_spec(&self, spec: ModelSpec) {
        info!(
            "Registered model {} (estimated {} MB)",
            spec.id, spec.estimated_size_mb
        );
        self.models.insert(spec.id.clone(), spec);
    }

    /// Registers a model unless it is already known, returning the active spec
    ///
    /// `loader` is only called when the model is new.
    pub fn get_or_register<F>(&self, model_id: &ModelId, loader: F) -> ModelSpec
    where
        F: FnOnce() -> Arc<dyn ModelLoader>,
    {
        if let Some(spec) = self.models.get(model_id) {
            return spec.value().clone();
        }

        self.models
            .entry(model_id.clone())
            .or_insert_with(|| {
                debug!("Registering model {} on first use", model_id);
                self.resolve(model_id.clone(), loader())
            })
            .value()
            .clone()
    }

    /// Gets the spec of a model
    pub fn get(&self, model_id: &ModelId) -> Option<ModelSpec> {
        self.models.get(model_id).map(|spec| spec.value().clone())
    }

    /// Removes a model from the registry
    pub fn unregister(&self, model_id: &ModelId) -> Option<ModelSpec> {
        self.models.remove(model_id).map(|(_, spec)| spec)
    }

    /// Returns true if the model is registered
    pub fn contains(&self, model_id: &ModelId) -> bool {
        self.models.contains_key(model_id)
    }

    /// Gets the identifiers of all registered models
    pub fn model_ids(&self) -> Vec<ModelId> {
        let mut ids: Vec<ModelId> = self.models.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Gets the number of registered models
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no model is registered
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
