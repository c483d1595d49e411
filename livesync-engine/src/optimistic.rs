//! Optimistic update tracking.
//!
//! At most one unresolved optimistic update exists per entity key. A second
//! update on a key whose update is still pending supersedes it: the patches
//! are folded (newer wins per field), the old timer is cancelled and the new
//! call's timeout applies.
//!
//! Status transitions are guarded:
//!
//! ```text
//! Pending ──confirm──▶ Committed
//!    │  └──timeout / publish failure──▶ RolledBack
//!    └──divergence──▶ Conflicted ──local / merge──▶ Committed
//!                               └──remote──────────▶ RolledBack
//! ```
//!
//! A transition only happens if the record is in an allowed source state
//! (and, for timer-driven transitions, still carries the id the timer was
//! armed for), so a late timer can never undo a commit.

use livesync_model::Payload;
use livesync_types::{EntityKey, Timestamp, UpdateId, Version};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// Lifecycle of an optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Pending,
    Committed,
    RolledBack,
    Conflicted,
}

impl UpdateStatus {
    /// Whether the update still occupies its key.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, UpdateStatus::Pending | UpdateStatus::Conflicted)
    }
}

/// Why an update was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// No confirmation arrived before the timeout.
    Timeout,
    /// The transport rejected the publish.
    PublishFailed,
}

/// A locally predicted mutation awaiting confirmation.
#[derive(Debug)]
pub struct OptimisticUpdate<P: Payload> {
    pub id: UpdateId,
    pub key: EntityKey,
    /// Every patch staged since the last committed value, folded.
    pub patch: P::Patch,
    /// Cache version the prediction was computed against.
    pub base_version: Version,
    /// The value shown to subscribers while unresolved.
    pub predicted: P,
    pub applied_at: Timestamp,
    pub timeout_at: Timestamp,
    pub status: UpdateStatus,
    timer: Option<AbortHandle>,
}

impl<P: Payload> OptimisticUpdate<P> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Whether a rollback timer is armed.
    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }
}

/// Result of staging a patch.
#[derive(Debug, Clone)]
pub struct Staged<P> {
    pub id: UpdateId,
    pub predicted: P,
    /// The pending update this one replaced, if any.
    pub superseded: Option<UpdateId>,
}

/// Holds unresolved optimistic updates and recent outcomes.
#[derive(Debug)]
pub struct OptimisticTracker<P: Payload> {
    active: HashMap<EntityKey, OptimisticUpdate<P>>,
    outcomes: VecDeque<(UpdateId, UpdateStatus)>,
    history: usize,
}

impl<P: Payload> OptimisticTracker<P> {
    /// Creates a tracker remembering up to `history` resolved outcomes.
    pub fn new(history: usize) -> Self {
        Self {
            active: HashMap::new(),
            outcomes: VecDeque::new(),
            history,
        }
    }

    /// Stages `patch` on top of the committed value `base`.
    ///
    /// A pending update on the same key is superseded. The caller must not
    /// stage on a key whose update is conflicted.
    pub fn stage(
        &mut self,
        key: EntityKey,
        patch: P::Patch,
        base: &P,
        base_version: Version,
        now: Timestamp,
        timeout: Duration,
    ) -> Staged<P> {
        let (patch, base_version, superseded) = match self.active.remove(&key) {
            Some(mut previous) => {
                previous.cancel_timer();
                debug!("Update {} on {} superseded", previous.id, key);
                (
                    P::merge_patches(&previous.patch, &patch),
                    previous.base_version,
                    Some(previous.id),
                )
            }
            None => (patch, base_version, None),
        };

        let id = UpdateId::new();
        let predicted = base.apply_patch(&patch);
        self.active.insert(
            key.clone(),
            OptimisticUpdate {
                id,
                key,
                patch,
                base_version,
                predicted: predicted.clone(),
                applied_at: now,
                timeout_at: now.saturating_add(timeout),
                status: UpdateStatus::Pending,
                timer: None,
            },
        );

        Staged {
            id,
            predicted,
            superseded,
        }
    }

    /// Attaches a rollback timer to the pending update `id`. If the update
    /// is gone or no longer pending, the timer is aborted instead.
    pub fn attach_timer(&mut self, key: &EntityKey, id: UpdateId, timer: AbortHandle) {
        match self
            .active
            .get_mut(key)
            .filter(|u| u.id == id && u.status == UpdateStatus::Pending)
        {
            Some(update) => {
                update.cancel_timer();
                update.timer = Some(timer);
            }
            None => timer.abort(),
        }
    }

    /// The unresolved update for `key`.
    pub fn get(&self, key: &EntityKey) -> Option<&OptimisticUpdate<P>> {
        self.active.get(key)
    }

    /// The predicted value for `key` while an update is unresolved.
    pub fn visible(&self, key: &EntityKey) -> Option<&P> {
        self.active.get(key).map(|u| &u.predicted)
    }

    /// Whether `key` has a pending (not conflicted) update.
    pub fn is_pending(&self, key: &EntityKey) -> bool {
        self.active
            .get(key)
            .is_some_and(|u| u.status == UpdateStatus::Pending)
    }

    /// Number of updates in `Pending`.
    pub fn pending_count(&self) -> usize {
        self.active
            .values()
            .filter(|u| u.status == UpdateStatus::Pending)
            .count()
    }

    /// Number of unresolved updates (pending or conflicted).
    pub fn unresolved_count(&self) -> usize {
        self.active.len()
    }

    /// Status of an unresolved or recently resolved update.
    pub fn status(&self, id: UpdateId) -> Option<UpdateStatus> {
        self.active
            .values()
            .find(|u| u.id == id)
            .map(|u| u.status)
            .or_else(|| {
                self.outcomes
                    .iter()
                    .rev()
                    .find(|(outcome_id, _)| *outcome_id == id)
                    .map(|(_, status)| *status)
            })
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Pending → Committed, when an authoritative update confirms the prediction.
    pub fn confirm(&mut self, key: &EntityKey) -> Option<OptimisticUpdate<P>> {
        self.finish(key, None, &[UpdateStatus::Pending], UpdateStatus::Committed)
    }

    /// Pending → Conflicted. The timer is cancelled; the record stays active.
    pub fn mark_conflicted(&mut self, key: &EntityKey) -> Option<&OptimisticUpdate<P>> {
        let update = self
            .active
            .get_mut(key)
            .filter(|u| u.status == UpdateStatus::Pending)?;
        update.cancel_timer();
        update.status = UpdateStatus::Conflicted;
        Some(update)
    }

    /// Pending → RolledBack for the update `id`, on timeout or publish failure.
    pub fn roll_back(
        &mut self,
        key: &EntityKey,
        id: UpdateId,
        reason: RollbackReason,
    ) -> Option<OptimisticUpdate<P>> {
        let update = self.finish(
            key,
            Some(id),
            &[UpdateStatus::Pending],
            UpdateStatus::RolledBack,
        )?;
        debug!("Update {} on {} rolled back: {:?}", id, key, reason);
        Some(update)
    }

    /// Conflicted → Committed / RolledBack, when the conflict is resolved.
    pub fn resolve(&mut self, key: &EntityKey, to: UpdateStatus) -> Option<OptimisticUpdate<P>> {
        self.finish(key, None, &[UpdateStatus::Conflicted], to)
    }

    fn finish(
        &mut self,
        key: &EntityKey,
        expected: Option<UpdateId>,
        from: &[UpdateStatus],
        to: UpdateStatus,
    ) -> Option<OptimisticUpdate<P>> {
        let eligible = self.active.get(key).is_some_and(|u| {
            from.contains(&u.status) && expected.is_none_or(|id| id == u.id)
        });
        if !eligible {
            return None;
        }
        let mut update = self.active.remove(key)?;
        update.cancel_timer();
        update.status = to;
        self.record_outcome(update.id, to);
        Some(update)
    }

    fn record_outcome(&mut self, id: UpdateId, status: UpdateStatus) {
        if self.history == 0 {
            return;
        }
        while self.outcomes.len() >= self.history {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((id, status));
    }

    /// Aborts every armed timer. Used when the engine shuts down.
    pub fn cancel_all_timers(&mut self) {
        for update in self.active.values_mut() {
            update.cancel_timer();
        }
    }
}

/// A detached copy of an unresolved update, safe to hand to callers.
#[derive(Debug, Clone)]
pub struct UpdateSnapshot<P: Payload> {
    pub id: UpdateId,
    pub key: EntityKey,
    pub patch: P::Patch,
    pub base_version: Version,
    pub predicted: P,
    pub applied_at: Timestamp,
    pub timeout_at: Timestamp,
    pub status: UpdateStatus,
}

impl<P: Payload> From<&OptimisticUpdate<P>> for UpdateSnapshot<P> {
    fn from(update: &OptimisticUpdate<P>) -> Self {
        Self {
            id: update.id,
            key: update.key.clone(),
            patch: update.patch.clone(),
            base_version: update.base_version,
            predicted: update.predicted.clone(),
            applied_at: update.applied_at,
            timeout_at: update.timeout_at,
            status: update.status,
        }
    }
}
