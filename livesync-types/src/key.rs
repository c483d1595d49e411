//! Entity keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identifier naming one synchronizable object.
///
/// Identity is the `(entity_type, entity_id)` pair; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    /// Creates a key from its two parts. No validation is performed.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Creates a key, rejecting an empty type or id.
    pub fn try_new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let key = Self::new(entity_type, entity_id);
        if key.entity_type.trim().is_empty() {
            return Err(crate::Error::InvalidKey("empty entity type".into()));
        }
        if key.entity_id.trim().is_empty() {
            return Err(crate::Error::InvalidKey(format!(
                "empty entity id for type {}",
                key.entity_type
            )));
        }
        Ok(key)
    }

    /// Returns true when both parts are non-blank.
    pub fn is_valid(&self) -> bool {
        !self.entity_type.trim().is_empty() && !self.entity_id.trim().is_empty()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}
