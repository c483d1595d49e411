//! Sync state aggregation.
//!
//! Derives the consumer-facing [`SyncState`] from the optimistic tracker and
//! the conflict manager, and decides when sync listeners must be notified.
//! Notifications are coalesced: the engine marks the state dirty on every
//! relevant mutation and flushes once per scheduler turn, skipping the flush
//! when nothing observable changed.

use crate::conflict::ConflictEntry;
use indexmap::IndexMap;
use livesync_types::{ListenerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Callback receiving sync state changes.
pub type SyncListener<P> = Arc<dyn Fn(&SyncState<P>) + Send + Sync>;

/// Health of the upstream transport, as reported by it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
}

/// Aggregate summary of pending work and conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState<P> {
    pub connection_status: ConnectionStatus,
    /// Optimistic updates awaiting confirmation.
    pub pending_updates: usize,
    /// Pending conflicts, oldest first.
    pub conflicts: Vec<ConflictEntry<P>>,
    /// When an authoritative value was last committed.
    pub last_sync_at: Option<Timestamp>,
}

impl<P> SyncState<P> {
    /// Whether nothing is pending and no conflict is open.
    pub fn is_settled(&self) -> bool {
        self.pending_updates == 0 && self.conflicts.is_empty()
    }
}

/// Holds sync listeners and the last notified state.
pub struct SyncAggregator<P> {
    connection_status: ConnectionStatus,
    last_sync_at: Option<Timestamp>,
    listeners: IndexMap<ListenerId, SyncListener<P>>,
    last_notified: Option<SyncState<P>>,
    flush_scheduled: bool,
}

impl<P> Default for SyncAggregator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> SyncAggregator<P> {
    pub fn new() -> Self {
        Self {
            connection_status: ConnectionStatus::default(),
            last_sync_at: None,
            listeners: IndexMap::new(),
            last_notified: None,
            flush_scheduled: false,
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    /// Updates the connection status. Returns `true` if it changed.
    pub fn set_connection_status(&mut self, status: ConnectionStatus) -> bool {
        let changed = self.connection_status != status;
        self.connection_status = status;
        changed
    }

    /// Records that an authoritative value was committed at `now`.
    pub fn record_sync(&mut self, now: Timestamp) {
        self.last_sync_at = Some(now);
    }

    pub fn last_sync_at(&self) -> Option<Timestamp> {
        self.last_sync_at
    }

    /// Builds the current state from its sources.
    pub fn compute(
        &self,
        pending_updates: usize,
        conflicts: Vec<ConflictEntry<P>>,
    ) -> SyncState<P> {
        SyncState {
            connection_status: self.connection_status,
            pending_updates,
            conflicts,
            last_sync_at: self.last_sync_at,
        }
    }

    /// Marks the state dirty. Returns `true` if the caller must schedule a
    /// flush; `false` if one is already scheduled or nobody is listening.
    ///
    /// Changes nobody heard about invalidate the last notified state, so the
    /// next listener's first flush always goes out.
    pub fn mark_dirty(&mut self) -> bool {
        if self.listeners.is_empty() {
            self.last_notified = None;
            return false;
        }
        if self.flush_scheduled {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    // ── Listeners ────────────────────────────────────────────────

    pub fn add_listener(&mut self, listener: SyncListener<P>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let removed = self.listeners.shift_remove(&id).is_some();
        if self.listeners.is_empty() {
            self.last_notified = None;
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<P: Clone + PartialEq> SyncAggregator<P> {
    /// Completes a scheduled flush. Returns the listeners to notify, or
    /// `None` when `state` equals the last notified state.
    pub fn finish_flush(&mut self, state: SyncState<P>) -> Option<Vec<SyncListener<P>>> {
        self.flush_scheduled = false;
        if self.listeners.is_empty() {
            self.last_notified = None;
            return None;
        }
        if self.last_notified.as_ref() == Some(&state) {
            return None;
        }
        self.last_notified = Some(state);
        Some(self.listeners.values().cloned().collect())
    }
}
