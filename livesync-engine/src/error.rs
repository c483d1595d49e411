//! Error types for the sync engine.

use livesync_types::{ConflictId, EntityKey, SubscriptionId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to callers of the engine.
///
/// Stale authoritative writes and timeout-driven rollbacks are not errors:
/// they are internal transitions, logged and observable through listeners.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Empty or unknown entity identifier. Nothing was sent to the transport.
    #[error("invalid target {key}: {reason}")]
    InvalidTarget { key: EntityKey, reason: String },

    /// The transport rejected an optimistic patch. The update was rolled back.
    #[error("publish failed: {0}")]
    PublishFailure(String),

    /// Resolve was called with an unknown or already-resolved conflict.
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// A conflict for this key must be resolved before a new optimistic update.
    #[error("conflict pending for {0}")]
    ConflictPending(EntityKey),

    /// Unsubscribe was called with an unknown subscription.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// The upstream transport failed outside of a publish.
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization error (configuration loading).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine needs a Tokio runtime for its timers.
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl EngineError {
    pub(crate) fn invalid_target(key: &EntityKey, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            key: key.clone(),
            reason: reason.into(),
        }
    }
}
