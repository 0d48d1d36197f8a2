//! Service requestors
//!
//! A requestor is the outer system's entry point for running one service
//! call. The adapters wrap it as an [`InferenceModel`] so that service calls go
//! through the queue and the model pool like any other inference.

use std::fmt;
use std::sync::Arc;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::models::InferencePayload;
use inference_engine::{InferenceModel, LoadedModel, ModelLoader, ModelSpec};

/// Kind of service an adapter fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Property prediction
    Property,
    /// Generation
    Generation,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Property => "property",
            ServiceKind::Generation => "generation",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One service call, as handed to the requestor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service_type: String,
    pub service_name: String,
    pub parameters: serde_json::Value,
}

impl From<&InferencePayload> for ServiceRequest {
    fn from(payload: &InferencePayload) -> Self {
        Self {
            service_type: payload.service_type.clone(),
            service_name: payload.service_name.clone(),
            parameters: payload.parameters.clone(),
        }
    }
}

/// Runs service calls; blocking
pub trait ServiceRequestor: Send + Sync {
    /// Routes a request to the service implementation and returns its result
    fn route_service(&self, request: &ServiceRequest) -> anyhow::Result<serde_json::Value>;
}

impl<F> ServiceRequestor for F
where
    F: Fn(&ServiceRequest) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    fn route_service(&self, request: &ServiceRequest) -> anyhow::Result<serde_json::Value> {
        self(request)
    }
}

/// A pooled model that forwards calls to a requestor
pub(crate) struct RoutedModel {
    kind: ServiceKind,
    requestor: Arc<dyn ServiceRequestor>,
}

impl InferenceModel for RoutedModel {
    fn predict(&self, payload: &InferencePayload) -> anyhow::Result<serde_json::Value> {
        debug!("Running {} inference with model {}", self.kind, payload.model_id);

        let result = self.requestor.route_service(&ServiceRequest::from(payload))?;
        if result.is_null() {
            bail!("{} service returned no result", self.kind);
        }

        Ok(result)
    }
}

/// Loader registered for every model an adapter derives
pub(crate) struct RoutedModelLoader {
    pub kind: ServiceKind,
    pub requestor: Arc<dyn ServiceRequestor>,
}

impl ModelLoader for RoutedModelLoader {
    fn load(&self, spec: &ModelSpec) -> anyhow::Result<LoadedModel> {
        debug!("Loading {} model {}", self.kind, spec.id);
        Ok(LoadedModel::new(RoutedModel {
            kind: self.kind,
            requestor: self.requestor.clone(),
        }))
    }
}
