//! Main integration module for modelserve
//!
//! This module wires the inference core together: one inference manager with
//! its model registry, shared by a property adapter and a generation adapter.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use common::models::RequestView;
use common::types::RequestId;
use inference_engine::{InferenceManager, InferenceStats, ModelRegistry};
use serving_config::{ConfigManager, InferenceConfig};
use service_adapters::{CancelResponse, ServiceAdapter, ServiceKind, ServiceRequestor};

pub use common;
pub use inference_engine;
pub use request_queue;
pub use resource_manager;
pub use service_adapters;
pub use serving_config;

/// Asynchronous model server
pub struct ModelServer {
    /// Shared inference manager
    manager: Arc<InferenceManager>,

    /// Property prediction adapter
    property: ServiceAdapter,

    /// Generation adapter
    generation: ServiceAdapter,
}

impl ModelServer {
    /// Creates a new model server
    pub fn new(
        config: InferenceConfig,
        property_requestor: Arc<dyn ServiceRequestor>,
        generation_requestor: Arc<dyn ServiceRequestor>,
    ) -> Result<Self> {
        info!("Initializing model server");

        let registry = Arc::new(ModelRegistry::from_config(&config));
        let manager = Arc::new(
            InferenceManager::new(config, registry)
                .context("Failed to create inference manager")?,
        );

        Ok(Self {
            property: ServiceAdapter::property(manager.clone(), property_requestor),
            generation: ServiceAdapter::generation(manager.clone(), generation_requestor),
            manager,
        })
    }

    /// Creates a model server from a loaded configuration
    pub fn from_config_manager(
        config_manager: &ConfigManager,
        property_requestor: Arc<dyn ServiceRequestor>,
        generation_requestor: Arc<dyn ServiceRequestor>,
    ) -> Result<Self> {
        Self::new(
            config_manager.config().clone(),
            property_requestor,
            generation_requestor,
        )
    }

    /// Starts the model server
    pub async fn start(&self) -> Result<()> {
        info!("Starting model server");

        self.manager
            .start()
            .await
            .context("Failed to start inference manager")?;

        info!("Model server started successfully");

        Ok(())
    }

    /// Stops the model server
    pub async fn stop(&self, wait: bool) -> Result<()> {
        info!("Stopping model server");

        self.manager
            .shutdown(wait)
            .await
            .context("Failed to stop inference manager")?;

        info!("Model server stopped successfully");

        Ok(())
    }

    /// Gets the adapter for a kind of service
    pub fn adapter(&self, kind: ServiceKind) -> &ServiceAdapter {
        match kind {
            ServiceKind::Property => &self.property,
            ServiceKind::Generation => &self.generation,
        }
    }

    /// Gets the property prediction adapter
    pub fn property(&self) -> &ServiceAdapter {
        &self.property
    }

    /// Gets the generation adapter
    pub fn generation(&self) -> &ServiceAdapter {
        &self.generation
    }

    /// Gets the inference manager
    pub fn manager(&self) -> Arc<InferenceManager> {
        self.manager.clone()
    }

    /// Gets the status of a request submitted through either adapter
    pub async fn status(&self, request_id: &RequestId) -> Result<RequestView> {
        Ok(self.property.status(request_id).await?)
    }

    /// Cancels a request submitted through either adapter
    pub async fn cancel(&self, request_id: &RequestId) -> Result<CancelResponse> {
        Ok(self.property.cancel(request_id).await?)
    }

    /// Gets queue, model pool and worker statistics
    pub fn stats(&self) -> InferenceStats {
        self.manager.stats()
    }
}
