//! Engine configuration.

use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rollback timeout (ms) for optimistic updates that don't pass one.
    pub default_timeout_ms: u64,
    /// Grace period (ms) before an upstream feed with no subscribers is closed.
    pub teardown_grace_ms: u64,
    /// Maximum cached entities. `None` keeps the cache unbounded.
    pub cache_capacity: Option<NonZeroUsize>,
    /// Resolved optimistic-update outcomes kept for status lookups.
    pub outcome_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            teardown_grace_ms: 3_000,
            cache_capacity: None,
            outcome_history: 256,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}
