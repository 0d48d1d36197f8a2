//! Model loading contracts
//!
//! Model code is supplied from outside the core through two traits: a
//! [`ModelLoader`] that builds an instance, and the [`InferenceModel`] it
//! returns. Both are synchronous; the manager runs them on the blocking pool.

use std::fmt;
use std::sync::Arc;

use common::models::InferencePayload;
use common::types::ModelId;

/// A loaded model that can serve inference calls
pub trait InferenceModel: Send + Sync {
    /// Runs one inference call
    fn predict(&self, payload: &InferencePayload) -> anyhow::Result<serde_json::Value>;
}

/// Builds model instances
pub trait ModelLoader: Send + Sync {
    /// Loads the model described by `spec`
    fn load(&self, spec: &ModelSpec) -> anyhow::Result<LoadedModel>;
}

impl<F> ModelLoader for F
where
    F: Fn(&ModelSpec) -> anyhow::Result<LoadedModel> + Send + Sync,
{
    fn load(&self, spec: &ModelSpec) -> anyhow::Result<LoadedModel> {
        self(spec)
    }
}

/// A freshly loaded model
pub struct LoadedModel {
    /// The model instance
    pub model: Arc<dyn InferenceModel>,

    /// Measured size in MB, when the loader can tell
    pub size_mb: Option<f64>,
}

impl LoadedModel {
    /// Wraps a model without a measured size
    pub fn new(model: impl InferenceModel + 'static) -> Self {
        Self {
            model: Arc::new(model),
            size_mb: None,
        }
    }

    /// Sets the measured size
    pub fn with_size_mb(mut self, size_mb: f64) -> Self {
        self.size_mb = Some(size_mb);
        self
    }
}

/// Everything the resource manager needs to load one model
#[derive(Clone)]
pub struct ModelSpec {
    /// Model identifier
    pub id: ModelId,

    /// Size reserved while loading, replaced by the measured size afterwards
    pub estimated_size_mb: f64,

    /// Timeout applied to requests for this model that carry none
    pub timeout_seconds: Option<u64>,

    /// Loader producing the instance
    pub loader: Arc<dyn ModelLoader>,
}

impl ModelSpec {
    /// Creates a model spec
    pub fn new(id: impl Into<ModelId>, estimated_size_mb: f64, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            id: id.into(),
            estimated_size_mb,
            timeout_seconds: None,
            loader,
        }
    }

    /// Sets the per-model timeout
    pub fn with_timeout(mut self, timeout_seconds: Option<u64>) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

impl fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSpec")
            .field("id", &self.id)
            .field("estimated_size_mb", &self.estimated_size_mb)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish_non_exhaustive()
    }
}
