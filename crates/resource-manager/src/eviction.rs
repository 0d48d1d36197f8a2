//! Eviction policies
//!
//! A policy only ranks candidates. The manager decides when eviction is
//! needed and guarantees that every candidate is loaded and idle.

use chrono::{DateTime, Utc};

use common::types::{EvictionStrategy, ModelId};

/// A loaded, idle model that may be unloaded
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub model_id: ModelId,
    pub size_mb: f64,
    pub load_time: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
}

/// Chooses which model to evict
pub trait EvictionPolicy: Send + Sync {
    /// Strategy implemented by this policy
    fn strategy(&self) -> EvictionStrategy;

    /// Picks the victim among the candidates, or `None` if there are none
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<ModelId>;
}

/// Evicts the model with the oldest `last_used`
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
    fn strategy(&self) -> EvictionStrategy {
        EvictionStrategy::Lru
    }

    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<ModelId> {
        candidates
            .iter()
            .min_by_key(|c| c.last_used)
            .map(|c| c.model_id.clone())
    }
}

/// Evicts the model with the lowest `use_count`, oldest `last_used` on ties
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastFrequentlyUsed;

impl EvictionPolicy for LeastFrequentlyUsed {
    fn strategy(&self) -> EvictionStrategy {
        EvictionStrategy::Lfu
    }

    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<ModelId> {
        candidates
            .iter()
            .min_by_key(|c| (c.use_count, c.last_used))
            .map(|c| c.model_id.clone())
    }
}

/// Evicts the largest model, oldest `last_used` on ties
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestSize;

impl EvictionPolicy for LargestSize {
    fn strategy(&self) -> EvictionStrategy {
        EvictionStrategy::Size
    }

    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<ModelId> {
        candidates
            .iter()
            .max_by(|a, b| {
                a.size_mb
                    .total_cmp(&b.size_mb)
                    .then_with(|| b.last_used.cmp(&a.last_used))
            })
            .map(|c| c.model_id.clone())
    }
}

/// Builds the policy for a configured strategy
pub fn policy_for(strategy: EvictionStrategy) -> Box<dyn EvictionPolicy> {
    match strategy {
        EvictionStrategy::Lru => Box::new(LeastRecentlyUsed),
        EvictionStrategy::Lfu => Box::new(LeastFrequentlyUsed),
        EvictionStrategy::Size => Box::new(LargestSize),
    }
}
