//! Worker and background loops
//!
//! Workers pull requests from the queue, borrow a model from the resource
//! manager and run the blocking inference call on the blocking pool. A
//! request's timeout is enforced cooperatively: when it expires the request is
//! marked as timed out and the call keeps running in the background until it
//! returns, holding its model until then.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use chrono::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, ErrorPayload};
use common::models::{Request, RequestStatus};
use common::types::RequestId;
use request_queue::RequestQueue;
use resource_manager::ModelResourceManager;
use serving_config::InferenceConfig;

use crate::registry::ModelRegistry;
use crate::store::ResultStore;

/// State shared by the manager, the workers and the background tasks
pub(crate) struct Shared {
    pub config: InferenceConfig,
    pub queue: RequestQueue,
    pub models: ModelResourceManager,
    pub registry: Arc<ModelRegistry>,
    pub store: Option<ResultStore>,
    /// Workers currently handling a request
    pub busy: AtomicUsize,
}

impl Shared {
    /// Records an outcome, ignoring requests that already finished
    pub async fn record(
        &self,
        id: &RequestId,
        status: RequestStatus,
        result: Option<serde_json::Value>,
        error: Option<ErrorPayload>,
    ) {
        match self.queue.update_status(id, status, result, error) {
            Ok(()) => self.persist(id).await,
            Err(e) if e.is_already_terminal() => {
                debug!("Request {} already finished, dropping {} outcome", id, status);
            },
            Err(e) => error!("Failed to record {} for request {}: {}", status, id, e),
        }
    }

    /// Writes a terminal request to the result store, if one is configured
    pub async fn persist(&self, id: &RequestId) {
        let store = match &self.store {
            Some(store) => store,
            None => return,
        };

        match self.queue.get_status(id) {
            Ok(request) if request.is_terminal() => {
                if let Err(e) = store.save(&request).await {
                    warn!("Failed to persist result of request {}: {}", id, e);
                }
            },
            Ok(_) => {},
            Err(e) => debug!("Not persisting request {}: {}", id, e),
        }
    }

    /// Handles one dequeued request from model lookup to terminal status
    pub async fn process(self: &Arc<Self>, worker_id: usize, request: Request) {
        let id = request.id;
        let model_id = request.payload.model_id.clone();
        let started = StdInstant::now();
        let deadline = request
            .timeout()
            .and_then(|timeout| timeout.to_std().ok())
            .and_then(|timeout| Instant::now().checked_add(timeout));

        debug!(
            "Worker {} processing request {} for model {}",
            worker_id, id, model_id
        );

        let spec = match self.registry.get(&model_id) {
            Some(spec) => spec,
            None => {
                let err = Error::ModelNotFound(model_id);
                warn!("Request {} failed: {}", id, err);
                self.record(&id, RequestStatus::Failed, None, Some(err.to_payload()))
                    .await;
                return;
            },
        };

        let handle = match self.models.acquire(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Request {} failed: {}", id, e);
                self.record(&id, RequestStatus::Failed, None, Some(e.to_payload()))
                    .await;
                return;
            },
        };

        // The sweeper may have finished the request while the model loaded
        let finished = self
            .queue
            .get_status(&id)
            .map(|current| current.is_terminal())
            .unwrap_or(true);
        if finished {
            self.models.release(&model_id);
            return;
        }
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            self.record(&id, RequestStatus::Timeout, None, Some(timeout_error(&request)))
                .await;
            self.models.release(&model_id);
            return;
        }

        let model = handle.model.clone();
        let payload = request.payload.clone();
        let mut call = tokio::task::spawn_blocking(move || model.predict(&payload));

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut call).await.ok(),
            None => Some((&mut call).await),
        };

        match outcome {
            Some(Ok(Ok(result))) => {
                info!(
                    "Request {} completed in {:.3}s",
                    id,
                    started.elapsed().as_secs_f64()
                );
                self.record(&id, RequestStatus::Completed, Some(result), None)
                    .await;
            },
            Some(Ok(Err(e))) => {
                error!("Inference for request {} failed: {:#}", id, e);
                self.record(
                    &id,
                    RequestStatus::Failed,
                    None,
                    Some(ErrorPayload::inference(&e)),
                )
                .await;
            },
            Some(Err(e)) => {
                error!("Inference for request {} panicked: {}", id, e);
                self.record(
                    &id,
                    RequestStatus::Failed,
                    None,
                    Some(Error::Inference(format!("inference panicked: {}", e)).to_payload()),
                )
                .await;
            },
            None => {
                warn!(
                    "Request {} exceeded its timeout of {}s",
                    id,
                    request.timeout_seconds.unwrap_or_default()
                );
                self.record(&id, RequestStatus::Timeout, None, Some(timeout_error(&request)))
                    .await;

                // The model stays lent until the abandoned call returns
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    match call.await {
                        Ok(_) => debug!("Abandoned call for request {} returned", id),
                        Err(e) => error!("Abandoned call for request {} panicked: {}", id, e),
                    }
                    shared.models.release(&model_id);
                });
                return;
            },
        }

        self.models.release(&model_id);
    }

    /// Purges expired requests and result files
    pub async fn cleanup(&self) -> usize {
        let ttl = Duration::from_std(self.config.result_ttl())
            .unwrap_or_else(|_| Duration::days(365));
        let mut removed = self.queue.purge_terminal(ttl);

        if let Some(store) = &self.store {
            match store.cleanup().await {
                Ok(files) => removed += files,
                Err(e) => error!("Result store cleanup failed: {}", e),
            }
        }

        removed
    }
}

fn timeout_error(request: &Request) -> ErrorPayload {
    Error::Timeout(format!(
        "Request timed out after {}s of processing",
        request.timeout_seconds.unwrap_or_default()
    ))
    .to_payload()
}

/// Pulls requests until shutdown
pub(crate) async fn run_worker(worker_id: usize, shared: Arc<Shared>, shutdown: CancellationToken) {
    info!("Worker {} started", worker_id);
    let poll_interval = shared.config.poll_interval();

    while !shutdown.is_cancelled() {
        let next = shared.queue.dequeue_next();
        for id in shared.queue.drain_dequeue_timeouts() {
            shared.persist(&id).await;
        }

        match next {
            Some(request) => {
                shared.busy.fetch_add(1, Ordering::SeqCst);
                shared.process(worker_id, request).await;
                shared.busy.fetch_sub(1, Ordering::SeqCst);
            },
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(poll_interval) => {},
                }
            },
        }
    }

    info!("Worker {} stopped", worker_id);
}

/// Periodically times out requests that exceeded their budget
pub(crate) async fn run_timeout_sweeper(shared: Arc<Shared>, shutdown: CancellationToken) {
    let interval = shared.config.timeout_sweep_interval();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {},
        }

        for id in shared.queue.sweep_timeouts() {
            warn!("Request {} timed out", id);
            shared.persist(&id).await;
        }
    }

    debug!("Timeout sweeper stopped");
}

/// Periodically purges expired results
pub(crate) async fn run_cleanup(shared: Arc<Shared>, shutdown: CancellationToken) {
    let interval = shared.config.cleanup_interval();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {},
        }

        let removed = shared.cleanup().await;
        debug!("Cleanup pass removed {} expired entries", removed);
    }

    debug!("Cleanup task stopped");
}
