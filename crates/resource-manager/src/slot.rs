//! Per-model slots
//!
//! Every model identifier the manager has seen owns one slot. The slot holds
//! an async mutex that serializes loads of that identifier, and the slot state
//! behind a short-lived synchronous lock.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use common::types::ModelId;

use crate::eviction::EvictionCandidate;
use crate::model::InferenceModel;

/// A borrowed model, valid for one inference call
///
/// Return it with [`crate::ModelResourceManager::release`] once the call
/// finished, so the model becomes eligible for eviction again.
#[derive(Clone)]
pub struct ModelHandle {
    /// Model identifier
    pub model_id: ModelId,

    /// Model instance
    pub model: Arc<dyn InferenceModel>,

    /// Accounted size in MB
    pub size_mb: f64,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("size_mb", &self.size_mb)
            .finish_non_exhaustive()
    }
}

/// A loaded model and its usage metadata
pub(crate) struct ModelEntry {
    pub model: Arc<dyn InferenceModel>,
    pub size_mb: f64,
    pub load_time: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    /// Inference calls currently holding the model
    pub active: usize,
}

impl ModelEntry {
    /// Records one more borrower and hands out a handle
    pub fn borrow(&mut self, model_id: &ModelId, now: DateTime<Utc>) -> ModelHandle {
        self.active += 1;
        self.use_count += 1;
        self.last_used = now;
        ModelHandle {
            model_id: model_id.clone(),
            model: self.model.clone(),
            size_mb: self.size_mb,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active == 0
    }

    pub fn candidate(&self, model_id: &ModelId) -> EvictionCandidate {
        EvictionCandidate {
            model_id: model_id.clone(),
            size_mb: self.size_mb,
            load_time: self.load_time,
            last_used: self.last_used,
            use_count: self.use_count,
        }
    }
}

pub(crate) enum SlotState {
    NotLoaded,
    Loading {
        reserved_mb: f64,
    },
    Ready(ModelEntry),
}

pub(crate) struct ModelSlot {
    /// Held for the whole acquire of this identifier
    pub load_lock: tokio::sync::Mutex<()>,
    pub state: Mutex<SlotState>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self {
            load_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState::NotLoaded),
        }
    }
}
