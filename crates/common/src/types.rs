//! Identifier types
//!
//! Request identifiers are UUIDs; model identifiers are strings built from the
//! parts that distinguish one loaded model from another.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of an inference request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Identifier of a loadable model
///
/// Two requests referencing the same `ModelId` share one loaded instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Creates a model identifier from a raw string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds an identifier from its parts, skipping empty ones
    ///
    /// ```
    /// use common::types::ModelId;
    ///
    /// let id = ModelId::from_parts(["molecules", "solubility", "", "v1"]);
    /// assert_eq!(id.as_str(), "molecules_solubility_v1");
    /// ```
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .filter(|part| !part.as_ref().is_empty())
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("_");
        Self(joined)
    }

    /// Returns the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Policy for choosing which loaded model to unload under resource pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvictionStrategy {
    /// Evict the model with the oldest `last_used`
    #[serde(rename = "least_recently_used", alias = "lru", alias = "LRU")]
    Lru,
    /// Evict the model with the lowest `use_count`
    #[serde(rename = "least_frequently_used", alias = "lfu", alias = "LFU")]
    Lfu,
    /// Evict the largest model first
    #[serde(rename = "largest_size", alias = "size", alias = "SIZE")]
    Size,
}

impl EvictionStrategy {
    /// Configuration name of the strategy
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "least_recently_used",
            EvictionStrategy::Lfu => "least_frequently_used",
            EvictionStrategy::Size => "largest_size",
        }
    }
}

impl Default for EvictionStrategy {
    fn default() -> Self {
        EvictionStrategy::Lru
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "least_recently_used" | "lru" => Ok(EvictionStrategy::Lru),
            "least_frequently_used" | "lfu" => Ok(EvictionStrategy::Lfu),
            "largest_size" | "size" => Ok(EvictionStrategy::Size),
            _ => Err(format!("Unknown eviction strategy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_parse() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn test_model_id_from_parts() {
        let id = ModelId::from_parts(["get_molecule_property", "esol", "", "solubility"]);
        assert_eq!(id.as_str(), "get_molecule_property_esol_solubility");
    }

    #[test]
    fn test_eviction_strategy_names() {
        assert_eq!("LRU".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lru);
        assert_eq!(
            "largest_size".parse::<EvictionStrategy>().unwrap(),
            EvictionStrategy::Size
        );
        let parsed: EvictionStrategy = serde_json::from_str("\"lfu\"").unwrap();
        assert_eq!(parsed, EvictionStrategy::Lfu);
        assert_eq!(
            serde_json::to_string(&EvictionStrategy::Lru).unwrap(),
            "\"least_recently_used\""
        );
    }
}
