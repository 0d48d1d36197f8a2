//! Inference manager
//!
//! The [`InferenceManager`] owns the request queue, the model pool, the worker
//! pool and the background sweeps. Callers submit requests and poll for
//! results; everything else happens on the workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::models::{InferencePayload, RequestPriority, RequestView};
use common::types::RequestId;
use request_queue::{CancelOutcome, RequestQueue};
use resource_manager::ModelResourceManager;
use serving_config::InferenceConfig;

use crate::registry::ModelRegistry;
use crate::stats::{InferenceStats, WorkerStats};
use crate::store::ResultStore;
use crate::worker::{run_cleanup, run_timeout_sweeper, run_worker, Shared};

/// Coordinates queuing, execution, timeouts and result retention
pub struct InferenceManager {
    /// State shared with the workers
    shared: Arc<Shared>,

    /// Stops workers and background tasks
    shutdown: CancellationToken,

    /// Worker tasks
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Timeout sweeper and cleanup tasks
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceManager {
    /// Creates a new inference manager
    ///
    /// The registry is shared: models registered after construction are
    /// visible to the workers.
    pub fn new(config: InferenceConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.validate()?;

        let store = config
            .result_dir
            .as_ref()
            .map(|dir| ResultStore::new(dir, config.result_ttl()));

        let shared = Arc::new(Shared {
            queue: RequestQueue::from_config(&config),
            models: ModelResourceManager::from_config(&config),
            registry,
            store,
            busy: AtomicUsize::new(0),
            config,
        });

        Ok(Self {
            shared,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Starts the workers and the background tasks
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Internal(
                "Inference manager has been shut down".to_string(),
            ));
        }

        if let Some(store) = &self.shared.store {
            tokio::fs::create_dir_all(store.dir()).await?;
        }

        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Inference manager is already running");
            return Ok(());
        }

        let max_workers = self.shared.config.max_workers;
        info!("Starting inference manager with {} workers", max_workers);

        for worker_id in 0..max_workers {
            workers.push(tokio::spawn(run_worker(
                worker_id,
                self.shared.clone(),
                self.shutdown.clone(),
            )));
        }

        let mut background = self.background.lock();
        background.push(tokio::spawn(run_timeout_sweeper(
            self.shared.clone(),
            self.shutdown.clone(),
        )));
        background.push(tokio::spawn(run_cleanup(
            self.shared.clone(),
            self.shutdown.clone(),
        )));

        info!("Inference manager started");

        Ok(())
    }

    /// Stops the workers and background tasks and unloads idle models
    ///
    /// With `wait`, returns once every task has exited; a worker in the middle
    /// of a request finishes that request first. A stopped manager cannot be
    /// started again.
    pub async fn shutdown(&self, wait: bool) -> Result<()> {
        info!("Shutting down inference manager");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            let mut background = self.background.lock();
            workers.drain(..).chain(background.drain(..)).collect()
        };

        if wait {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Inference task failed during shutdown: {}", e);
                }
            }
        }

        let unloaded = self.shared.models.clear();
        info!("Inference manager stopped, {} models unloaded", unloaded);

        Ok(())
    }

    /// Queues a request without waiting for it to run
    ///
    /// A missing priority falls back to the configured default. A missing
    /// timeout falls back to the model's configured timeout, then to the
    /// configured default.
    pub fn submit_request(
        &self,
        payload: InferencePayload,
        priority: Option<RequestPriority>,
        timeout_seconds: Option<u64>,
    ) -> Result<RequestId> {
        let spec = self
            .shared
            .registry
            .get(&payload.model_id)
            .ok_or_else(|| Error::ModelNotFound(payload.model_id.clone()))?;

        let priority = priority.unwrap_or(self.shared.config.default_priority);
        let timeout_seconds = timeout_seconds
            .or(spec.timeout_seconds)
            .or(self.shared.config.default_timeout_seconds);

        let id = self.shared.queue.submit(payload, priority, timeout_seconds)?;

        info!(
            "Submitted request {} for model {} with priority {}",
            id, spec.id, priority
        );

        Ok(id)
    }

    /// Gets the current projection of a request
    ///
    /// Falls back to the result store once the in-memory record was purged.
    pub async fn get_result(&self, id: &RequestId) -> Result<RequestView> {
        match self.shared.queue.get_status(id) {
            Ok(request) => return Ok(request.view()),
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {},
        }

        if let Some(store) = &self.shared.store {
            match store.load(id).await {
                Ok(Some(view)) => return Ok(view),
                Ok(None) => {},
                Err(e) => warn!("Failed to read stored result of request {}: {}", id, e),
            }
        }

        Err(Error::RequestNotFound(*id))
    }

    /// Cancels a pending request
    pub async fn cancel(&self, id: &RequestId) -> Result<CancelOutcome> {
        let outcome = self.shared.queue.cancel(id)?;
        if outcome.is_canceled() {
            self.shared.persist(id).await;
        }
        Ok(outcome)
    }

    /// Times out expired requests now instead of waiting for the sweeper
    pub async fn sweep_timeouts(&self) -> usize {
        let timed_out = self.shared.queue.sweep_timeouts();
        for id in &timed_out {
            self.shared.persist(id).await;
        }
        timed_out.len()
    }

    /// Purges expired requests and result files now
    pub async fn cleanup(&self) -> usize {
        self.shared.cleanup().await
    }

    /// Gets queue, model pool and worker statistics
    pub fn stats(&self) -> InferenceStats {
        let running = self
            .workers
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count();

        InferenceStats {
            queue: self.shared.queue.stats(),
            models: self.shared.models.stats(),
            workers: WorkerStats {
                max_workers: self.shared.config.max_workers,
                running,
                busy: self.shared.busy.load(Ordering::SeqCst),
            },
        }
    }

    /// Gets the model registry
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.shared.registry
    }

    /// Gets the effective configuration
    pub fn config(&self) -> &InferenceConfig {
        &self.shared.config
    }

    /// Gets the model pool
    pub fn models(&self) -> &ModelResourceManager {
        &self.shared.models
    }
}

impl Drop for InferenceManager {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            debug!("Inference manager dropped without shutdown, stopping tasks");
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};

    use common::error::ErrorKind;
    use common::models::RequestStatus;
    use common::types::ModelId;
    use resource_manager::{InferenceModel, LoadedModel, ModelLoader, ModelSpec};

    /// Echoes its parameters; `sleep_ms` delays the call, `fail` makes it fail
    /// and `panic` makes it panic after the delay
    struct ScriptedModel {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl InferenceModel for ScriptedModel {
        fn predict(&self, payload: &InferencePayload) -> anyhow::Result<Value> {
            let params = &payload.parameters;
            if let Some(tag) = params.get("tag").and_then(Value::as_str) {
                self.calls.lock().push(tag.to_string());
            }
            if let Some(ms) = params.get("sleep_ms").and_then(Value::as_u64) {
                std::thread::sleep(Duration::from_millis(ms));
            }
            if params.get("panic").and_then(Value::as_bool).unwrap_or(false) {
                panic!("scripted panic");
            }
            if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                anyhow::bail!("scripted failure");
            }
            Ok(params.clone())
        }
    }

    fn scripted_loader(calls: Arc<Mutex<Vec<String>>>) -> Arc<dyn ModelLoader> {
        Arc::new(move |_: &ModelSpec| -> anyhow::Result<LoadedModel> {
            Ok(LoadedModel::new(ScriptedModel {
                calls: calls.clone(),
            }))
        })
    }

    fn test_config() -> InferenceConfig {
        InferenceConfig {
            poll_interval_ms: 10,
            timeout_sweep_interval_ms: 50,
            ..InferenceConfig::default()
        }
    }

    fn manager_with(config: InferenceConfig) -> (InferenceManager, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ModelRegistry::from_config(&config));
        registry.register("scripted", scripted_loader(calls.clone()));
        registry.register("other", scripted_loader(calls.clone()));
        (InferenceManager::new(config, registry).unwrap(), calls)
    }

    fn payload(params: Value) -> InferencePayload {
        InferencePayload::new("scripted", params)
    }

    async fn wait_terminal(manager: &InferenceManager, id: &RequestId) -> RequestView {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let view = manager.get_result(id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "request {} never finished",
                id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (manager, _) = manager_with(test_config());
        manager.start().await.unwrap();

        let id = manager
            .submit_request(payload(json!({"smiles": "CCO"})), None, None)
            .unwrap();
        let view = wait_terminal(&manager, &id).await;

        assert_eq!(view.status, RequestStatus::Completed);
        assert_eq!(view.priority, RequestPriority::Normal);
        assert_eq!(view.result, Some(json!({"smiles": "CCO"})));
        assert!(view.completed_at.is_some());

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_worker_processes_by_priority() {
        let config = InferenceConfig {
            max_workers: 1,
            max_concurrent_requests: 1,
            ..test_config()
        };
        let (manager, calls) = manager_with(config);

        let submissions = [
            ("low", RequestPriority::Low),
            ("normal-1", RequestPriority::Normal),
            ("critical", RequestPriority::Critical),
            ("normal-2", RequestPriority::Normal),
            ("high", RequestPriority::High),
        ];
        let mut ids = Vec::new();
        for (tag, priority) in submissions {
            ids.push(
                manager
                    .submit_request(payload(json!({ "tag": tag })), Some(priority), None)
                    .unwrap(),
            );
        }

        manager.start().await.unwrap();
        for id in &ids {
            assert_eq!(wait_terminal(&manager, id).await.status, RequestStatus::Completed);
        }

        assert_eq!(
            *calls.lock(),
            vec!["critical", "high", "normal-1", "normal-2", "low"]
        );
        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_inference_error_fails_request_only() {
        let (manager, _) = manager_with(test_config());
        manager.start().await.unwrap();

        let failing = manager
            .submit_request(payload(json!({"fail": true})), None, None)
            .unwrap();
        let view = wait_terminal(&manager, &failing).await;
        assert_eq!(view.status, RequestStatus::Failed);
        let error = view.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Inference);
        assert!(error.message.contains("scripted failure"));
        assert!(view.result.is_none());

        // Workers keep serving
        let ok = manager
            .submit_request(payload(json!({"x": 1})), None, None)
            .unwrap();
        assert_eq!(wait_terminal(&manager, &ok).await.status, RequestStatus::Completed);

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let (manager, _) = manager_with(test_config());
        let err = manager
            .submit_request(InferencePayload::new("missing", json!({})), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(ref id) if id == &ModelId::new("missing")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_marks_request() {
        let (manager, _) = manager_with(test_config());
        manager.start().await.unwrap();

        let id = manager
            .submit_request(payload(json!({"sleep_ms": 2000})), None, Some(1))
            .unwrap();
        let view = wait_terminal(&manager, &id).await;

        assert_eq!(view.status, RequestStatus::Timeout);
        assert_eq!(view.error.unwrap().kind, ErrorKind::Timeout);
        assert!(view.elapsed_seconds < 2.5);

        manager.shutdown(false).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_abandoned_call_releases_model() {
        let (manager, _) = manager_with(test_config());
        manager.start().await.unwrap();

        let id = manager
            .submit_request(
                payload(json!({"sleep_ms": 1500, "panic": true})),
                None,
                Some(1),
            )
            .unwrap();
        assert_eq!(wait_terminal(&manager, &id).await.status, RequestStatus::Timeout);

        let scripted = ModelId::new("scripted");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.stats().models.models.get(&scripted).map(|m| m.active) != Some(0) {
            assert!(tokio::time::Instant::now() < deadline, "model never released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The late panic did not overwrite the outcome
        let view = manager.get_result(&id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Timeout);

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_request() {
        let (manager, _) = manager_with(test_config());

        let id = manager
            .submit_request(payload(json!({})), None, None)
            .unwrap();
        assert_eq!(manager.cancel(&id).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(
            manager.cancel(&id).await.unwrap(),
            CancelOutcome::AlreadyTerminal(RequestStatus::Canceled)
        );
        assert!(manager.cancel(&RequestId::new()).await.unwrap_err().is_not_found());

        let view = manager.get_result(&id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Canceled);

        // A canceled request is never run
        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.get_result(&id).await.unwrap().status, RequestStatus::Canceled);
        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exhausted_pool_fails_request() {
        let config = InferenceConfig {
            max_models: 1,
            max_workers: 2,
            max_concurrent_requests: 2,
            ..test_config()
        };
        let (manager, _) = manager_with(config);
        manager.start().await.unwrap();

        let busy = manager
            .submit_request(payload(json!({"sleep_ms": 500})), None, None)
            .unwrap();

        // Wait until the first model is loaded and lent out
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.stats().models.models.get(&ModelId::new("scripted")).map(|m| m.active) != Some(1) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let blocked = manager
            .submit_request(InferencePayload::new("other", json!({})), None, None)
            .unwrap();
        let view = wait_terminal(&manager, &blocked).await;
        assert_eq!(view.status, RequestStatus::Failed);
        assert_eq!(view.error.unwrap().kind, ErrorKind::ResourceExhausted);

        assert_eq!(wait_terminal(&manager, &busy).await.status, RequestStatus::Completed);
        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_results_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = InferenceConfig {
            result_dir: Some(dir.path().to_path_buf()),
            ..test_config()
        };
        let (manager, _) = manager_with(config);
        manager.start().await.unwrap();

        let id = manager
            .submit_request(payload(json!({"y": 2})), None, None)
            .unwrap();
        wait_terminal(&manager, &id).await;

        let path = dir.path().join(format!("{}.json", id));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stored: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored["status"], "completed");
        assert_eq!(stored["result"], json!({"y": 2}));
        assert!(stored["expires_at"].is_string());

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_expired_in_queue_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = InferenceConfig {
            result_dir: Some(dir.path().to_path_buf()),
            // Leave expiry to the workers
            timeout_sweep_interval_ms: 60_000,
            ..test_config()
        };
        let (manager, calls) = manager_with(config);

        let id = manager
            .submit_request(payload(json!({"tag": "stale"})), None, Some(1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        manager.start().await.unwrap();

        let view = wait_terminal(&manager, &id).await;
        assert_eq!(view.status, RequestStatus::Timeout);

        let path = dir.path().join(format!("{}.json", id));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stored: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored["status"], "timeout");
        assert_eq!(stored["error"]["kind"], "timeout");
        assert!(stored["error"]["message"]
            .as_str()
            .unwrap()
            .contains("waiting in queue"));
        assert!(calls.lock().is_empty());

        manager.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let (manager, _) = manager_with(test_config());
        manager.start().await.unwrap();
        assert_eq!(manager.stats().workers.max_workers, 4);

        let id = manager.submit_request(payload(json!({})), None, None).unwrap();
        wait_terminal(&manager, &id).await;

        manager.shutdown(true).await.unwrap();
        let stats = manager.stats();
        assert_eq!(stats.workers.running, 0);
        assert_eq!(stats.models.loaded_models, 0);
        assert_eq!(stats.queue.status_counts[&RequestStatus::Completed], 1);

        assert!(manager.start().await.is_err());
    }
}
