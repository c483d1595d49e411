//! Conflict detection and resolution.
//!
//! A conflict is opened when an authoritative snapshot arrives for a key with
//! a pending optimistic update and the snapshot differs from the prediction.
//! The conflict freezes the key: further snapshots are dropped until the
//! consumer resolves it, so resolution always runs against one remote value.

use indexmap::IndexMap;
use livesync_model::Payload;
use livesync_types::{ConflictId, EntityKey, ListenerId, Timestamp, UpdateId, Version};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Callback receiving newly detected conflicts.
pub type ConflictListener<P> = Arc<dyn Fn(&ConflictEntry<P>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the locally predicted value.
    Local,
    /// Accept the authoritative value and discard the local patch.
    Remote,
    /// Reapply the local patch on top of the authoritative value.
    Merge,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
        };
        f.write_str(s)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

/// Divergence between a prediction and an authoritative snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry<P> {
    pub id: ConflictId,
    pub key: EntityKey,
    /// The optimistically predicted value.
    pub local_data: P,
    /// The authoritative value that diverged from it.
    pub remote_data: P,
    pub remote_version: Version,
    /// The optimistic update this conflict belongs to.
    pub update_id: UpdateId,
    pub detected_at: Timestamp,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
}

impl<P: Payload> ConflictEntry<P> {
    /// The value and version to commit for `resolution`.
    ///
    /// `local_patch` is the folded patch of the conflicted update; `Merge`
    /// reapplies it on top of the remote value, so only explicitly patched
    /// fields keep their local value. `Local` and `Merge` produce a value the
    /// server has not seen and bump the version past the remote one.
    pub fn resolved_value(
        &self,
        resolution: Resolution,
        local_patch: Option<&P::Patch>,
    ) -> (P, Version) {
        match resolution {
            Resolution::Local => (self.local_data.clone(), self.remote_version.next()),
            Resolution::Remote => (self.remote_data.clone(), self.remote_version),
            Resolution::Merge => {
                let merged = match local_patch {
                    Some(patch) => self.remote_data.apply_patch(patch),
                    None => self.local_data.clone(),
                };
                (merged, self.remote_version.next())
            }
        }
    }
}

/// Holds pending conflicts and conflict listeners.
pub struct ConflictManager<P> {
    pending: IndexMap<ConflictId, ConflictEntry<P>>,
    by_key: HashMap<EntityKey, ConflictId>,
    listeners: IndexMap<ListenerId, ConflictListener<P>>,
}

impl<P> Default for ConflictManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ConflictManager<P> {
    pub fn new() -> Self {
        Self {
            pending: IndexMap::new(),
            by_key: HashMap::new(),
            listeners: IndexMap::new(),
        }
    }
}

impl<P: Payload> ConflictManager<P> {
    /// Records a new pending conflict and returns a copy of it.
    pub fn open(
        &mut self,
        key: EntityKey,
        update_id: UpdateId,
        local_data: P,
        remote_data: P,
        remote_version: Version,
        now: Timestamp,
    ) -> ConflictEntry<P> {
        let entry = ConflictEntry {
            id: ConflictId::new(),
            key: key.clone(),
            local_data,
            remote_data,
            remote_version,
            update_id,
            detected_at: now,
            status: ConflictStatus::Pending,
            resolution: None,
        };
        if let Some(stale) = self.by_key.insert(key, entry.id) {
            self.pending.shift_remove(&stale);
        }
        self.pending.insert(entry.id, entry.clone());
        entry
    }

    /// Removes a pending conflict, marking it resolved with `resolution`.
    pub fn take(&mut self, id: ConflictId, resolution: Resolution) -> Option<ConflictEntry<P>> {
        let mut entry = self.pending.shift_remove(&id)?;
        self.by_key.remove(&entry.key);
        entry.status = ConflictStatus::Resolved;
        entry.resolution = Some(resolution);
        Some(entry)
    }

    pub fn get(&self, id: ConflictId) -> Option<&ConflictEntry<P>> {
        self.pending.get(&id)
    }

    /// The pending conflict for `key`.
    pub fn for_key(&self, key: &EntityKey) -> Option<&ConflictEntry<P>> {
        self.by_key.get(key).and_then(|id| self.pending.get(id))
    }

    /// Whether `key` is frozen by a pending conflict.
    pub fn has_pending(&self, key: &EntityKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// All pending conflicts, oldest first.
    pub fn snapshot(&self) -> Vec<ConflictEntry<P>> {
        self.pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    // ── Listeners ────────────────────────────────────────────────

    pub fn add_listener(&mut self, listener: ConflictListener<P>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.shift_remove(&id).is_some()
    }

    /// Current listeners, in registration order.
    pub fn listeners(&self) -> Vec<ConflictListener<P>> {
        self.listeners.values().cloned().collect()
    }
}
