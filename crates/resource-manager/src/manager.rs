//! Model pool management
//!
//! This module provides the [`ModelResourceManager`], which loads models on
//! demand, lends them to inference calls and evicts idle ones to stay within
//! the configured model count and memory budget.
//!
//! Lock order is the budget lock, then the slot map, then a slot's state lock.
//! The per-slot load lock is always taken first and never while holding any of
//! the others.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytesize::ByteSize;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::types::{EvictionStrategy, ModelId};
use serving_config::InferenceConfig;

use crate::eviction::{policy_for, EvictionCandidate, EvictionPolicy};
use crate::model::ModelSpec;
use crate::slot::{ModelEntry, ModelHandle, ModelSlot, SlotState};
use crate::stats::{ModelUsage, PoolStats};

/// Models and memory accounted to loaded and loading slots
#[derive(Debug, Default)]
struct Budget {
    models: usize,
    memory_mb: f64,
}

/// Bounded pool of loaded models
pub struct ModelResourceManager {
    /// One slot per model identifier ever requested
    slots: DashMap<ModelId, Arc<ModelSlot>>,

    /// Reserved capacity
    budget: Mutex<Budget>,

    /// Eviction policy
    policy: Box<dyn EvictionPolicy>,

    /// Maximum number of loaded models
    max_models: usize,

    /// Memory limit in MB
    max_memory_mb: Option<f64>,

    /// Memory kept free below the limit
    memory_headroom_mb: f64,
}

impl ModelResourceManager {
    /// Creates a new model resource manager
    pub fn new(
        max_models: usize,
        max_memory_mb: Option<f64>,
        memory_headroom_mb: f64,
        strategy: EvictionStrategy,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            budget: Mutex::new(Budget::default()),
            policy: policy_for(strategy),
            max_models: max_models.max(1),
            max_memory_mb,
            memory_headroom_mb: memory_headroom_mb.max(0.0),
        }
    }

    /// Creates a model resource manager from configuration
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(
            config.max_models,
            config.max_memory_mb,
            config.memory_headroom_mb,
            config.eviction_strategy,
        )
    }

    /// Replaces the eviction policy
    pub fn with_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Gets the eviction strategy in use
    pub fn strategy(&self) -> EvictionStrategy {
        self.policy.strategy()
    }

    fn memory_limit_mb(&self) -> Option<f64> {
        self.max_memory_mb
            .map(|max| (max - self.memory_headroom_mb).max(0.0))
    }

    fn fits(&self, budget: &Budget, size_mb: f64) -> bool {
        budget.models < self.max_models
            && self
                .memory_limit_mb()
                .map_or(true, |limit| budget.memory_mb + size_mb <= limit)
    }

    fn slot(&self, model_id: &ModelId) -> Arc<ModelSlot> {
        self.slots
            .entry(model_id.clone())
            .or_insert_with(|| Arc::new(ModelSlot::new()))
            .value()
            .clone()
    }

    fn snapshot(&self) -> Vec<(ModelId, Arc<ModelSlot>)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Lends a ready model, loading it first if needed
    ///
    /// Concurrent calls for the same identifier wait for the first load and then
    /// share its result. Calls for different identifiers load in parallel.
    pub async fn acquire(&self, spec: &ModelSpec) -> Result<ModelHandle> {
        let slot = self.slot(&spec.id);
        let _load_guard = slot.load_lock.lock().await;

        if let SlotState::Ready(entry) = &mut *slot.state.lock() {
            debug!("Reusing loaded model {}", spec.id);
            return Ok(entry.borrow(&spec.id, Utc::now()));
        }

        let reserved_mb = spec.estimated_size_mb.max(0.0);
        self.reserve(&spec.id, &slot, reserved_mb)?;
        let mut reservation = Reservation {
            manager: self,
            slot: &slot,
            reserved_mb,
            armed: true,
        };

        info!(
            "Loading model {} (estimated {})",
            spec.id,
            format_mb(reserved_mb)
        );

        let started = Instant::now();
        let loader = spec.loader.clone();
        let load_spec = spec.clone();
        let loaded = match tokio::task::spawn_blocking(move || loader.load(&load_spec)).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                error!("Failed to load model {}: {:#}", spec.id, e);
                return Err(Error::ModelLoad(format!(
                    "Failed to load model {}: {:#}",
                    spec.id, e
                )));
            },
            Err(e) => {
                error!("Loader for model {} panicked: {}", spec.id, e);
                return Err(Error::ModelLoad(format!(
                    "Loader for model {} panicked: {}",
                    spec.id, e
                )));
            },
        };

        let size_mb = loaded
            .size_mb
            .filter(|size| size.is_finite() && *size >= 0.0)
            .unwrap_or(reserved_mb);
        let now = Utc::now();

        reservation.armed = false;
        let (handle, memory_mb) = {
            let mut budget = self.budget.lock();
            budget.memory_mb += size_mb - reserved_mb;

            let mut entry = ModelEntry {
                model: loaded.model,
                size_mb,
                load_time: now,
                last_used: now,
                use_count: 0,
                active: 0,
            };
            let handle = entry.borrow(&spec.id, now);
            *slot.state.lock() = SlotState::Ready(entry);
            (handle, budget.memory_mb)
        };

        if let Some(limit) = self.memory_limit_mb() {
            if memory_mb > limit {
                warn!(
                    "Model {} measured {}, pool now uses {} of {}",
                    spec.id,
                    format_mb(size_mb),
                    format_mb(memory_mb),
                    format_mb(limit)
                );
            }
        }

        info!(
            "Model {} loaded in {:.2}s ({})",
            spec.id,
            started.elapsed().as_secs_f64(),
            format_mb(size_mb)
        );

        Ok(handle)
    }

    /// Reserves room for a model, evicting idle models as needed
    fn reserve(&self, model_id: &ModelId, slot: &ModelSlot, size_mb: f64) -> Result<()> {
        let mut budget = self.budget.lock();
        // Taken under the budget lock so loads that just finished are candidates
        let slots = self.snapshot();
        let mut skipped: HashSet<ModelId> = HashSet::new();

        while !self.fits(&budget, size_mb) {
            let candidates: Vec<EvictionCandidate> = slots
                .iter()
                .filter(|(id, _)| id != model_id && !skipped.contains(id))
                .filter_map(|(id, slot)| match &*slot.state.lock() {
                    SlotState::Ready(entry) if entry.is_idle() => Some(entry.candidate(id)),
                    _ => None,
                })
                .collect();

            let victim = self.policy.select_victim(&candidates).ok_or_else(|| {
                Error::ResourceExhausted(format!(
                    "Cannot load model {} ({}): {} of {} models loaded ({} reserved) and none can be evicted",
                    model_id,
                    format_mb(size_mb),
                    budget.models,
                    self.max_models,
                    format_mb(budget.memory_mb)
                ))
            })?;

            let unloaded = slots
                .iter()
                .find(|(id, _)| *id == victim)
                .and_then(|(_, victim_slot)| unload(victim_slot));

            match unloaded {
                Some(victim_mb) => {
                    budget.models = budget.models.saturating_sub(1);
                    budget.memory_mb = (budget.memory_mb - victim_mb).max(0.0);
                    warn!(
                        "Evicted model {} ({}) using {} to make room for {}",
                        victim,
                        format_mb(victim_mb),
                        self.policy.strategy(),
                        model_id
                    );
                },
                None => {
                    skipped.insert(victim);
                },
            }
        }

        budget.models += 1;
        budget.memory_mb += size_mb;
        *slot.state.lock() = SlotState::Loading {
            reserved_mb: size_mb,
        };

        Ok(())
    }

    /// Returns the reservation of a load that did not complete
    fn abandon(&self, slot: &ModelSlot, reserved_mb: f64) {
        let mut budget = self.budget.lock();
        budget.models = budget.models.saturating_sub(1);
        budget.memory_mb = (budget.memory_mb - reserved_mb).max(0.0);
        *slot.state.lock() = SlotState::NotLoaded;
    }

    /// Returns a model lent by [`acquire`](Self::acquire)
    ///
    /// The model stays loaded; it only becomes eligible for eviction once no
    /// call holds it.
    pub fn release(&self, model_id: &ModelId) {
        let slot = match self.slots.get(model_id) {
            Some(slot) => slot.value().clone(),
            None => {
                warn!("Release of unknown model {}", model_id);
                return;
            },
        };

        let mut state = slot.state.lock();
        match &mut *state {
            SlotState::Ready(entry) if entry.active > 0 => entry.active -= 1,
            _ => warn!("Release of model {} that is not lent out", model_id),
        }
    }

    /// Unloads an idle model
    ///
    /// Returns false if the model is not loaded, still loading or in use.
    pub fn evict(&self, model_id: &ModelId) -> bool {
        let slot = match self.slots.get(model_id) {
            Some(slot) => slot.value().clone(),
            None => return false,
        };

        let mut budget = self.budget.lock();
        match unload(&slot) {
            Some(size_mb) => {
                budget.models = budget.models.saturating_sub(1);
                budget.memory_mb = (budget.memory_mb - size_mb).max(0.0);
                info!("Evicted model {} ({})", model_id, format_mb(size_mb));
                true
            },
            None => false,
        }
    }

    /// Unloads every idle model, returning how many were unloaded
    pub fn clear(&self) -> usize {
        let evicted = self
            .snapshot()
            .into_iter()
            .filter(|(id, _)| self.evict(id))
            .count();

        if evicted > 0 {
            info!("Cleared {} models from the pool", evicted);
        }

        evicted
    }

    /// Returns true if the model is loaded
    pub fn is_loaded(&self, model_id: &ModelId) -> bool {
        self.slots
            .get(model_id)
            .map(|slot| matches!(&*slot.state.lock(), SlotState::Ready(_)))
            .unwrap_or(false)
    }

    /// Gets pool statistics
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            loaded_models: 0,
            loading_models: 0,
            total_memory_mb: 0.0,
            models: BTreeMap::new(),
            max_models: self.max_models,
            max_memory_mb: self.max_memory_mb,
            memory_headroom_mb: self.memory_headroom_mb,
            eviction_strategy: self.policy.strategy(),
        };

        for (id, slot) in self.snapshot() {
            let usage = match &*slot.state.lock() {
                SlotState::NotLoaded => continue,
                SlotState::Loading { reserved_mb, .. } => {
                    stats.loading_models += 1;
                    ModelUsage {
                        size_mb: *reserved_mb,
                        load_time: None,
                        last_used: None,
                        use_count: 0,
                        active: 0,
                        is_loading: true,
                    }
                },
                SlotState::Ready(entry) => {
                    stats.loaded_models += 1;
                    ModelUsage {
                        size_mb: entry.size_mb,
                        load_time: Some(entry.load_time),
                        last_used: Some(entry.last_used),
                        use_count: entry.use_count,
                        active: entry.active,
                        is_loading: false,
                    }
                },
            };
            stats.total_memory_mb += usage.size_mb;
            stats.models.insert(id, usage);
        }

        stats
    }
}

/// Drops a model from its slot if it is loaded and idle, returning its size
fn unload(slot: &ModelSlot) -> Option<f64> {
    let mut state = slot.state.lock();
    let size_mb = match &*state {
        SlotState::Ready(entry) if entry.is_idle() => entry.size_mb,
        _ => return None,
    };
    *state = SlotState::NotLoaded;
    Some(size_mb)
}

/// Gives the reservation back unless the load completed
struct Reservation<'a> {
    manager: &'a ModelResourceManager,
    slot: &'a ModelSlot,
    reserved_mb: f64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon(self.slot, self.reserved_mb);
        }
    }
}

fn format_mb(mb: f64) -> ByteSize {
    ByteSize::b((mb.max(0.0) * 1024.0 * 1024.0) as u64)
}
