//! Service adapter
//!
//! This module provides the [`ServiceAdapter`], the asynchronous entry point
//! used by the property and generation services.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use common::error::{Error, Result};
use common::models::{InferencePayload, RequestPriority, RequestView};
use common::types::{ModelId, RequestId};
use inference_engine::{CancelOutcome, InferenceManager, InferenceStats};

use crate::requestor::{RoutedModelLoader, ServiceKind, ServiceRequestor};

/// Parameters that select a distinct model within one service
const MODEL_PARAMETERS: [&str; 5] = [
    "algorithm_type",
    "domain",
    "algorithm_name",
    "algorithm_version",
    "algorithm_application",
];

/// Derives the identifier of the model serving a request
///
/// The identifier joins the service type, the service name and the requested
/// property types, followed by `<name>_<value>` for every model-selecting
/// parameter present.
pub fn derive_model_id(service_type: &str, service_name: &str, parameters: &Value) -> ModelId {
    let mut parts: Vec<String> = vec![service_type.to_string(), service_name.to_string()];

    match parameters.get("property_type") {
        Some(Value::Array(types)) => parts.extend(types.iter().map(value_text)),
        Some(Value::Null) | None => {},
        Some(other) => parts.push(value_text(other)),
    }

    for name in MODEL_PARAMETERS {
        if let Some(value) = parameters.get(name) {
            parts.push(name.to_string());
            parts.push(value_text(value));
        }
    }

    ModelId::from_parts(parts)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Maps a priority name, case-insensitively; unknown names yield `None`
pub fn parse_priority(priority: &str) -> Option<RequestPriority> {
    priority.parse().ok()
}

/// Response to a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: RequestId,
}

/// Response to a cancellation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CancelResponse {
    fn result(message: impl Into<String>) -> Self {
        Self {
            result: Some(message.into()),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Adapter between a service requestor and the shared inference manager
pub struct ServiceAdapter {
    /// Kind of service fronted
    kind: ServiceKind,

    /// Shared inference manager
    manager: Arc<InferenceManager>,

    /// Service implementation
    requestor: Arc<dyn ServiceRequestor>,
}

impl ServiceAdapter {
    /// Creates a new service adapter
    pub fn new(
        kind: ServiceKind,
        manager: Arc<InferenceManager>,
        requestor: Arc<dyn ServiceRequestor>,
    ) -> Self {
        info!("{} service adapter initialized", kind);
        Self {
            kind,
            manager,
            requestor,
        }
    }

    /// Creates an adapter for property prediction
    pub fn property(manager: Arc<InferenceManager>, requestor: Arc<dyn ServiceRequestor>) -> Self {
        Self::new(ServiceKind::Property, manager, requestor)
    }

    /// Creates an adapter for generation
    pub fn generation(manager: Arc<InferenceManager>, requestor: Arc<dyn ServiceRequestor>) -> Self {
        Self::new(ServiceKind::Generation, manager, requestor)
    }

    /// Gets the kind of service fronted
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Submits a service request for asynchronous execution
    ///
    /// The model is registered on first use. Unknown priority names fall back
    /// to the configured default priority.
    pub fn submit(
        &self,
        service_type: &str,
        service_name: &str,
        parameters: Value,
        priority: Option<&str>,
        timeout_seconds: Option<u64>,
    ) -> Result<SubmitResponse> {
        let model_id = derive_model_id(service_type, service_name, &parameters);
        if model_id.as_str().is_empty() {
            return Err(Error::InvalidArgument(
                "service_type and service_name must not both be empty".to_string(),
            ));
        }

        self.manager.registry().get_or_register(&model_id, || {
            Arc::new(RoutedModelLoader {
                kind: self.kind,
                requestor: self.requestor.clone(),
            })
        });

        let default_priority = self.manager.config().default_priority;
        let priority = match priority {
            Some(name) => parse_priority(name).unwrap_or_else(|| {
                warn!(
                    "Unknown priority {:?}, using {}",
                    name, default_priority
                );
                default_priority
            }),
            None => default_priority,
        };

        let payload = InferencePayload {
            model_id,
            service_type: service_type.to_string(),
            service_name: service_name.to_string(),
            parameters,
        };

        let request_id = self
            .manager
            .submit_request(payload, Some(priority), timeout_seconds)?;

        Ok(SubmitResponse { request_id })
    }

    /// Gets the status of a request
    pub async fn status(&self, request_id: &RequestId) -> Result<RequestView> {
        self.manager.get_result(request_id).await
    }

    /// Cancels a request
    ///
    /// Canceling a request that already finished is not an error.
    pub async fn cancel(&self, request_id: &RequestId) -> Result<CancelResponse> {
        let response = match self.manager.cancel(request_id).await? {
            CancelOutcome::Canceled => CancelResponse::result("Request canceled successfully"),
            CancelOutcome::AlreadyTerminal(status) => {
                CancelResponse::result(format!("Request already {}", status))
            },
            CancelOutcome::InProgress => {
                CancelResponse::error("Failed to cancel request: request is being processed")
            },
        };

        Ok(response)
    }

    /// Gets queue, model pool and worker statistics
    pub fn stats(&self) -> InferenceStats {
        self.manager.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use common::error::ErrorKind;
    use common::models::RequestStatus;
    use inference_engine::ModelRegistry;
    use serving_config::InferenceConfig;

    use crate::requestor::ServiceRequest;

    fn manager() -> Arc<InferenceManager> {
        let config = InferenceConfig {
            poll_interval_ms: 10,
            timeout_sweep_interval_ms: 50,
            ..InferenceConfig::default()
        };
        let registry = Arc::new(ModelRegistry::from_config(&config));
        Arc::new(InferenceManager::new(config, registry).unwrap())
    }

    fn echo() -> Arc<dyn ServiceRequestor> {
        Arc::new(|request: &ServiceRequest| -> anyhow::Result<Value> {
            if request.parameters.get("empty").is_some() {
                return Ok(Value::Null);
            }
            Ok(json!({
                "service": request.service_name,
                "parameters": request.parameters,
            }))
        })
    }

    async fn wait_terminal(adapter: &ServiceAdapter, id: &RequestId) -> RequestView {
        for _ in 0..500 {
            let view = adapter.status(id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {} never finished", id);
    }

    #[test]
    fn test_derive_model_id() {
        let id = derive_model_id(
            "get_molecule_property",
            "esol",
            &json!({
                "property_type": ["solubility", "logp"],
                "domain": "molecules",
                "algorithm_version": 2,
                "subjects": ["CCO"],
            }),
        );
        assert_eq!(
            id.as_str(),
            "get_molecule_property_esol_solubility_logp_domain_molecules_algorithm_version_2"
        );

        let id = derive_model_id("generation", "moler", &json!({"property_type": "qed"}));
        assert_eq!(id.as_str(), "generation_moler_qed");
    }

    #[test]
    fn test_parse_priority() {
        assert_eq!(parse_priority("HIGH"), Some(RequestPriority::High));
        assert_eq!(parse_priority("critical"), Some(RequestPriority::Critical));
        assert_eq!(parse_priority("urgent"), None);
    }

    #[tokio::test]
    async fn test_submit_and_poll() {
        let manager = manager();
        manager.start().await.unwrap();
        let adapter = ServiceAdapter::property(manager.clone(), echo());

        let response = adapter
            .submit(
                "get_molecule_property",
                "esol",
                json!({"property_type": ["solubility"], "subjects": ["CCO"]}),
                Some("urgent"),
                None,
            )
            .unwrap();

        let view = wait_terminal(&adapter, &response.request_id).await;
        assert_eq!(view.status, RequestStatus::Completed);
        assert_eq!(view.priority, RequestPriority::Normal);
        assert_eq!(view.result.unwrap()["service"], "esol");
        assert!(manager
            .registry()
            .contains(&ModelId::new("get_molecule_property_esol_solubility")));

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_null_result_fails_request() {
        let manager = manager();
        manager.start().await.unwrap();
        let adapter = ServiceAdapter::generation(manager.clone(), echo());

        let response = adapter
            .submit("generation", "moler", json!({"empty": true}), None, None)
            .unwrap();

        let view = wait_terminal(&adapter, &response.request_id).await;
        assert_eq!(view.status, RequestStatus::Failed);
        let error = view.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Inference);
        assert!(error.message.contains("generation service returned no result"));

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let manager = manager();
        let adapter = ServiceAdapter::property(manager, echo());

        let response = adapter
            .submit("get_protein_property", "solubility", json!({}), Some("low"), None)
            .unwrap();

        let first = adapter.cancel(&response.request_id).await.unwrap();
        assert_eq!(first.result.as_deref(), Some("Request canceled successfully"));

        let second = adapter.cancel(&response.request_id).await.unwrap();
        assert_eq!(second.result.as_deref(), Some("Request already canceled"));
        assert!(second.error.is_none());

        assert!(adapter.cancel(&RequestId::new()).await.unwrap_err().is_not_found());

        let stats = adapter.stats();
        assert_eq!(stats.queue.status_counts[&RequestStatus::Canceled], 1);
        assert_eq!(stats.queue.queue_length, 0);
    }

    #[tokio::test]
    async fn test_adapters_share_one_manager() {
        let manager = manager();
        let property = ServiceAdapter::property(manager.clone(), echo());
        let generation = ServiceAdapter::generation(manager.clone(), echo());

        property
            .submit("get_molecule_property", "esol", json!({}), None, None)
            .unwrap();
        generation
            .submit("generation", "moler", json!({}), None, None)
            .unwrap();
        property
            .submit("get_molecule_property", "esol", json!({}), None, None)
            .unwrap();

        assert_eq!(manager.registry().len(), 2);
        assert_eq!(property.stats().queue.queue_length, 3);
        assert_eq!(generation.kind(), ServiceKind::Generation);
    }
}
