//! Core type definitions for the live entity sync engine.
//!
//! This crate defines the small, payload-agnostic value types shared by
//! every layer of the engine:
//! - [`EntityKey`]: the `(entity_type, entity_id)` pair naming one synchronizable object
//! - Handle identifiers for subscriptions, optimistic updates, conflicts and listeners (UUID v7)
//! - [`Version`] stamps and millisecond [`Timestamp`]s
//!
//! Payload types and their merge rules live in `livesync-model`.

mod ids;
mod key;
mod version;

pub use ids::{ConflictId, ListenerId, SubscriptionId, UpdateId};
pub use key::EntityKey;
pub use version::{Timestamp, Version};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid entity key: {0}")]
    InvalidKey(String),
}
