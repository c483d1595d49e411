//! Sync engine: the consumer-facing facade.
//!
//! All state lives behind one mutex and every handler runs to completion
//! while holding it, without awaiting. The only suspension points are the
//! outbound publish inside [`SyncEngine::apply_optimistic_update`] and the
//! timers, which re-enter the engine through a weak reference.
//!
//! Listener callbacks never run under the lock. Handlers collect their side
//! effects (per-key fan-out, conflict notices, resync requests) and run them
//! after releasing it.
//!
//! Opening and closing a feed are transport calls made outside the lock.
//! While one is in flight for a key, `subscribe` on that key waits for it to
//! return, so a key never has two open or close calls racing each other.

use crate::cache::{CacheEntry, CacheStats, EntityCache, PutOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::conflict::{ConflictEntry, ConflictListener, ConflictManager, Resolution};
use crate::error::{EngineError, EngineResult};
use crate::optimistic::{OptimisticTracker, RollbackReason, UpdateSnapshot, UpdateStatus};
use crate::registry::{DataListener, FeedAction, SubscriptionRegistry};
use crate::state::{ConnectionStatus, SyncAggregator, SyncState};
use crate::transport::{DeliveryTarget, EntityTransport, UpstreamSink};
use livesync_model::Payload;
use livesync_types::{ConflictId, EntityKey, ListenerId, SubscriptionId, UpdateId, Version};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Which listener set a [`ListenerHandle`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Conflict,
    Sync,
}

trait ListenerOwner: Send + Sync {
    fn detach(&self, kind: ListenerKind, id: ListenerId) -> bool;
}

/// Returned by [`SyncEngine::on_conflict`] and [`SyncEngine::on_sync`].
///
/// Dropping the handle keeps the listener registered; call
/// [`ListenerHandle::unsubscribe`] to remove it.
pub struct ListenerHandle {
    id: ListenerId,
    kind: ListenerKind,
    owner: Weak<dyn ListenerOwner>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.owner.upgrade() {
            Some(owner) => owner.detach(self.kind, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct EngineState<P: Payload> {
    cache: EntityCache<P>,
    registry: SubscriptionRegistry<P>,
    tracker: OptimisticTracker<P>,
    conflicts: ConflictManager<P>,
    sync: SyncAggregator<P>,
}

impl<P: Payload> EngineState<P> {
    fn new(config: &EngineConfig) -> Self {
        Self {
            cache: EntityCache::new(config.cache_capacity),
            registry: SubscriptionRegistry::new(),
            tracker: OptimisticTracker::new(config.outcome_history),
            conflicts: ConflictManager::new(),
            sync: SyncAggregator::new(),
        }
    }

    fn sync_state(&self) -> SyncState<P> {
        self.sync
            .compute(self.tracker.pending_count(), self.conflicts.snapshot())
    }

    fn visible_value(&self, key: &EntityKey) -> Option<P> {
        self.tracker
            .visible(key)
            .or_else(|| self.cache.peek(key).map(|entry| &entry.value))
            .cloned()
    }
}

/// Side effects to run once the state lock is released.
struct Effects<P: Payload> {
    drain: Vec<EntityKey>,
    conflicts: Vec<(Vec<ConflictListener<P>>, ConflictEntry<P>)>,
    resync: Vec<EntityKey>,
}

impl<P: Payload> Default for Effects<P> {
    fn default() -> Self {
        Self {
            drain: Vec::new(),
            conflicts: Vec::new(),
            resync: Vec::new(),
        }
    }
}

struct EngineInner<P: Payload> {
    me: Weak<EngineInner<P>>,
    config: EngineConfig,
    state: Mutex<EngineState<P>>,
    /// Signalled whenever a feed leaves `Opening` or `Closing`.
    feed_settled: Condvar,
    transport: Arc<dyn EntityTransport<P>>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
}

/// The real-time entity sync engine.
///
/// Cheap to clone; clones share state. Must be created inside a Tokio
/// runtime, which drives its timers.
pub struct SyncEngine<P: Payload> {
    inner: Arc<EngineInner<P>>,
}

impl<P: Payload> Clone for SyncEngine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Payload> SyncEngine<P> {
    /// Creates an engine reading the system clock.
    pub fn new(transport: Arc<dyn EntityTransport<P>>, config: EngineConfig) -> EngineResult<Self> {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    /// Creates an engine with an explicit clock.
    pub fn with_clock(
        transport: Arc<dyn EntityTransport<P>>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let inner = Arc::new_cyclic(|me| EngineInner {
            me: me.clone(),
            state: Mutex::new(EngineState::new(&config)),
            feed_settled: Condvar::new(),
            config,
            transport,
            clock,
            runtime,
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Subscribes `on_data` to the visible value of an entity.
    ///
    /// If a value is cached (or predicted), `on_data` receives it before any
    /// later delivery for the key. The first subscriber opens the upstream
    /// feed; later ones share it.
    pub fn subscribe<F>(
        &self,
        entity_type: &str,
        entity_id: &str,
        on_data: F,
    ) -> EngineResult<SubscriptionId>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let key = EntityKey::new(entity_type, entity_id);
        if !key.is_valid() {
            return Err(EngineError::invalid_target(&key, "empty entity type or id"));
        }
        self.inner.subscribe(key, Arc::new(on_data))
    }

    /// Removes a subscription. The last one for a key arms the feed teardown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> EngineResult<()> {
        self.inner.unsubscribe(id)
    }

    // ── Optimistic updates ───────────────────────────────────────

    /// Applies `patch` locally, fans out the prediction and publishes the
    /// patch. Rolls back after `timeout` (or the configured default) unless
    /// an authoritative snapshot settles it first.
    ///
    /// Fails with `InvalidTarget` before touching the network if the key is
    /// empty or has neither a cached value nor a pending prediction, and with
    /// `PublishFailure` (after an immediate rollback) if the transport rejects
    /// the patch. A rejected publish whose update was already settled by an
    /// authoritative snapshot is not an error.
    pub async fn apply_optimistic_update(
        &self,
        entity_type: &str,
        entity_id: &str,
        patch: P::Patch,
        timeout: Option<Duration>,
    ) -> EngineResult<UpdateId> {
        let key = EntityKey::new(entity_type, entity_id);
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_timeout());
        let id = self.inner.stage_update(&key, patch.clone(), timeout)?;

        match self.inner.transport.publish(&key, &patch).await {
            Ok(()) => {
                debug!("Published update {} for {}", id, key);
                Ok(id)
            }
            Err(e) => {
                let reason = match e {
                    EngineError::PublishFailure(reason) => reason,
                    other => other.to_string(),
                };
                if self.inner.roll_back(&key, id, RollbackReason::PublishFailed) {
                    warn!("Publish of update {} for {} failed: {}", id, key, reason);
                    return Err(EngineError::PublishFailure(reason));
                }
                warn!(
                    "Publish of update {} for {} failed after it was settled or superseded: {}",
                    id, key, reason
                );
                Ok(id)
            }
        }
    }

    /// Status of an unresolved or recently resolved optimistic update.
    pub fn update_status(&self, id: UpdateId) -> Option<UpdateStatus> {
        self.inner.lock().tracker.status(id)
    }

    /// The unresolved optimistic update for a key.
    pub fn pending_update(&self, key: &EntityKey) -> Option<UpdateSnapshot<P>> {
        self.inner.lock().tracker.get(key).map(UpdateSnapshot::from)
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Registers a listener for newly detected conflicts.
    pub fn on_conflict<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ConflictEntry<P>) + Send + Sync + 'static,
    {
        let id = self.inner.lock().conflicts.add_listener(Arc::new(listener));
        self.handle(ListenerKind::Conflict, id)
    }

    /// All pending conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictEntry<P>> {
        self.inner.lock().conflicts.snapshot()
    }

    /// Settles a pending conflict and unfreezes its key.
    pub fn resolve_conflict(&self, id: ConflictId, resolution: Resolution) -> EngineResult<()> {
        self.inner.resolve_conflict(id, resolution)
    }

    // ── Sync state ───────────────────────────────────────────────

    pub fn sync_state(&self) -> SyncState<P> {
        self.inner.lock().sync_state()
    }

    /// Registers a listener for sync state changes. Changes made within one
    /// scheduler turn produce a single notification.
    pub fn on_sync<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SyncState<P>) + Send + Sync + 'static,
    {
        let id = self.inner.lock().sync.add_listener(Arc::new(listener));
        self.handle(ListenerKind::Sync, id)
    }

    /// Called by the transport when its connection state changes.
    pub fn report_connection_status(&self, status: ConnectionStatus) {
        let inner = &self.inner;
        let mut guard = inner.lock();
        let st = &mut *guard;
        if st.sync.set_connection_status(status) {
            debug!("Connection status now {:?}", status);
            inner.touch_sync(st);
        }
    }

    // ── Cache & feeds ────────────────────────────────────────────

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.lock().cache.stats()
    }

    /// The value subscribers currently see for a key: the prediction while
    /// an update is unresolved, else the cached value. Does not count as a
    /// cache lookup.
    pub fn visible_value(&self, key: &EntityKey) -> Option<P> {
        self.inner.lock().visible_value(key)
    }

    /// The cached authoritative entry for a key, without counting a lookup.
    pub fn cached_entry(&self, key: &EntityKey) -> Option<CacheEntry<P>> {
        self.inner.lock().cache.peek(key).cloned()
    }

    pub fn has_feed(&self, key: &EntityKey) -> bool {
        self.inner.lock().registry.has_feed(key)
    }

    pub fn live_feed_count(&self) -> usize {
        self.inner.lock().registry.live_feed_count()
    }

    /// Feed reference count for a key, or 0 without a feed.
    pub fn feed_ref_count(&self, key: &EntityKey) -> usize {
        self.inner
            .lock()
            .registry
            .feed(key)
            .map(|feed| feed.ref_count)
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, key: &EntityKey) -> usize {
        self.inner.lock().registry.subscriber_count(key)
    }

    fn handle(&self, kind: ListenerKind, id: ListenerId) -> ListenerHandle {
        let owner: Weak<dyn ListenerOwner> = self.inner.me.clone();
        ListenerHandle { id, kind, owner }
    }
}

impl<P: Payload> EngineInner<P> {
    fn lock(&self) -> MutexGuard<'_, EngineState<P>> {
        // Handlers never leave state half-updated, so a poisoned lock is usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Handlers ─────────────────────────────────────────────────

    /// Blocks until no open or close call is in flight for `key`.
    fn wait_for_feed<'a>(
        &'a self,
        guard: MutexGuard<'a, EngineState<P>>,
        key: &EntityKey,
    ) -> MutexGuard<'a, EngineState<P>> {
        self.feed_settled
            .wait_while(guard, |st| st.registry.feed_in_transition(key))
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, key: EntityKey, listener: DataListener<P>) -> EngineResult<SubscriptionId> {
        let now = self.clock.now();
        let mut effects = Effects::default();
        let (id, action, claimed) = {
            let mut guard = self.wait_for_feed(self.lock(), &key);
            let st = &mut *guard;
            let (id, action) = st.registry.register(key.clone(), listener, now);
            let cached = st.cache.get(&key).map(|entry| entry.value.clone());
            // Holding the outbox while the feed opens keeps the first
            // pushed value behind the cached one.
            let claimed = match st.tracker.visible(&key).cloned().or(cached) {
                Some(value) => st.registry.enqueue_one(id, value),
                None => action == FeedAction::Open && st.registry.claim_outbox(&key),
            };
            (id, action, claimed)
        };
        debug!("Subscription {} on {} ({:?})", id, key, action);

        if action == FeedAction::Open {
            let target: Weak<dyn DeliveryTarget<P>> = self.me.clone();
            let sink = UpstreamSink::new(key.clone(), target);
            let opened = self.transport.open_feed(&key, sink);
            {
                let mut st = self.lock();
                match &opened {
                    Ok(()) => st.registry.mark_live(&key),
                    Err(_) => {
                        st.registry.remove(id);
                        st.registry.discard_feed(&key);
                        if claimed {
                            st.registry.abandon_outbox(&key);
                        }
                    }
                }
            }
            self.feed_settled.notify_all();
            if let Err(e) = opened {
                warn!("Failed to open feed for {}: {}", key, e);
                return Err(e);
            }
            debug!("Opened feed for {}", key);
        }

        if claimed {
            effects.drain.push(key);
        }
        self.run(effects);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> EngineResult<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let (key, remaining) = st
            .registry
            .remove(id)
            .ok_or(EngineError::SubscriptionNotFound(id))?;
        debug!("Unsubscribed {} from {} ({} left)", id, key, remaining);

        if remaining == 0 {
            if let Some(token) = st.registry.begin_teardown(&key) {
                let timer = self.spawn_teardown(key.clone(), token);
                st.registry.attach_teardown_timer(&key, token, timer);
            }
        }
        Ok(())
    }

    fn teardown_feed(&self, key: &EntityKey, token: u64) {
        if !self.lock().registry.begin_close(key, token) {
            return;
        }
        self.transport.close_feed(key);
        self.lock().registry.finish_close(key);
        self.feed_settled.notify_all();
        debug!("Closed idle feed for {}", key);
    }

    fn on_authoritative_update(&self, key: &EntityKey, payload: P, version: Version) {
        let now = self.clock.now();
        let mut effects = Effects::default();
        {
            let mut guard = self.lock();
            let st = &mut *guard;

            if st.conflicts.has_pending(key) {
                warn!("Dropping {} for {}: conflict pending", version, key);
                return;
            }
            if let Some(entry) = st.cache.peek(key) {
                if version < entry.version {
                    warn!(
                        "Dropping stale {} for {}: cached {}",
                        version, key, entry.version
                    );
                    return;
                }
            }

            let pending = st
                .tracker
                .get(key)
                .filter(|update| update.status == UpdateStatus::Pending)
                .map(|update| (update.id, update.predicted.clone()));

            match pending {
                None => {
                    if self.commit(st, key, payload, version, &mut effects) {
                        st.sync.record_sync(now);
                    }
                }
                Some((update_id, predicted)) if predicted == payload => {
                    self.commit(st, key, payload, version, &mut effects);
                    st.sync.record_sync(now);
                    st.tracker.confirm(key);
                    info!("Update {} on {} confirmed at {}", update_id, key, version);
                    self.touch_sync(st);
                }
                Some((update_id, predicted)) => {
                    st.tracker.mark_conflicted(key);
                    let entry =
                        st.conflicts
                            .open(key.clone(), update_id, predicted, payload, version, now);
                    warn!(
                        "Conflict {} on {}: {} diverges from update {}",
                        entry.id, key, version, update_id
                    );
                    let listeners = st.conflicts.listeners();
                    if !listeners.is_empty() {
                        effects.conflicts.push((listeners, entry));
                    }
                    self.touch_sync(st);
                }
            }
        }
        self.run(effects);
    }

    fn stage_update(
        &self,
        key: &EntityKey,
        patch: P::Patch,
        timeout: Duration,
    ) -> EngineResult<UpdateId> {
        if !key.is_valid() {
            return Err(EngineError::invalid_target(key, "empty entity type or id"));
        }
        let now = self.clock.now();
        let mut effects = Effects::default();
        let id = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.conflicts.has_pending(key) {
                return Err(EngineError::ConflictPending(key.clone()));
            }
            let committed = st
                .cache
                .get(key)
                .map(|entry| (entry.value.clone(), entry.version));
            // An evicted key keeps its prediction; stage on top of it.
            let pending = || {
                st.tracker
                    .get(key)
                    .filter(|update| update.status == UpdateStatus::Pending)
                    .map(|update| (update.predicted.clone(), update.base_version))
            };
            let Some((base, base_version)) = committed.or_else(pending) else {
                let reason = if st.registry.has_feed(key) {
                    "no authoritative value received yet"
                } else {
                    "entity is neither cached nor subscribed"
                };
                return Err(EngineError::invalid_target(key, reason));
            };

            let staged = st
                .tracker
                .stage(key.clone(), patch, &base, base_version, now, timeout);
            if let Some(previous) = staged.superseded {
                debug!("Update {} supersedes {} on {}", staged.id, previous, key);
            }
            let timer = self.spawn_rollback(key.clone(), staged.id, timeout);
            st.tracker.attach_timer(key, staged.id, timer);

            if st.registry.enqueue_fanout(key, staged.predicted) {
                effects.drain.push(key.clone());
            }
            self.touch_sync(st);
            staged.id
        };
        self.run(effects);
        Ok(id)
    }

    /// Rolls back the pending update `id`. Returns `false` if it had
    /// already settled.
    fn roll_back(&self, key: &EntityKey, id: UpdateId, reason: RollbackReason) -> bool {
        let mut effects = Effects::default();
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.tracker.roll_back(key, id, reason).is_none() {
                return false;
            }
            info!("Rolled back update {} on {} ({:?})", id, key, reason);
            if let Some(restored) = st.cache.peek(key).map(|entry| entry.value.clone()) {
                if st.registry.enqueue_fanout(key, restored) {
                    effects.drain.push(key.clone());
                }
            }
            self.touch_sync(st);
        }
        self.run(effects);
        true
    }

    fn resolve_conflict(&self, id: ConflictId, resolution: Resolution) -> EngineResult<()> {
        let mut effects = Effects::default();
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let Some(entry) = st.conflicts.take(id, resolution) else {
                debug!("Resolve requested for unknown conflict {}", id);
                return Err(EngineError::ConflictNotFound(id));
            };
            let key = entry.key.clone();
            let patch = st.tracker.get(&key).map(|update| update.patch.clone());
            let (value, version) = entry.resolved_value(resolution, patch.as_ref());
            self.commit(st, &key, value, version, &mut effects);

            let status = match resolution {
                Resolution::Remote => UpdateStatus::RolledBack,
                Resolution::Local | Resolution::Merge => UpdateStatus::Committed,
            };
            st.tracker.resolve(&key, status);
            info!(
                "Resolved conflict {} on {} with {} at {}",
                id, key, resolution, version
            );
            self.touch_sync(st);
        }
        self.run(effects);
        Ok(())
    }

    fn flush_sync(&self) {
        let (state, listeners) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let state = st.sync_state();
            match st.sync.finish_flush(state.clone()) {
                Some(listeners) => (state, listeners),
                None => return,
            }
        };
        for listener in &listeners {
            listener(&state);
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Writes an authoritative value and queues it for subscribers.
    /// Returns `false` if the cache rejected it as stale.
    fn commit(
        &self,
        st: &mut EngineState<P>,
        key: &EntityKey,
        value: P,
        version: Version,
        effects: &mut Effects<P>,
    ) -> bool {
        let outcome = st
            .cache
            .put(key.clone(), value.clone(), version, self.clock.now());
        if let PutOutcome::Inserted {
            evicted: Some(evicted),
        } = &outcome
        {
            if st.registry.subscriber_count(&evicted.key) > 0 {
                warn!("Evicted subscribed entity {}; requesting resync", evicted.key);
                effects.resync.push(evicted.key.clone());
            }
        }
        if !outcome.is_applied() {
            return false;
        }
        if st.registry.enqueue_fanout(key, value) {
            effects.drain.push(key.clone());
        }
        true
    }

    fn touch_sync(&self, st: &mut EngineState<P>) {
        if st.sync.mark_dirty() {
            let me = self.me.clone();
            self.runtime.spawn(async move {
                if let Some(inner) = me.upgrade() {
                    inner.flush_sync();
                }
            });
        }
    }

    fn spawn_rollback(&self, key: EntityKey, id: UpdateId, timeout: Duration) -> AbortHandle {
        let me = self.me.clone();
        self.runtime
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = me.upgrade() {
                    inner.roll_back(&key, id, RollbackReason::Timeout);
                }
            })
            .abort_handle()
    }

    fn spawn_teardown(&self, key: EntityKey, token: u64) -> AbortHandle {
        let me = self.me.clone();
        let grace = self.config.teardown_grace();
        self.runtime
            .spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(inner) = me.upgrade() {
                    inner.teardown_feed(&key, token);
                }
            })
            .abort_handle()
    }

    fn run(&self, effects: Effects<P>) {
        for key in &effects.drain {
            self.drain(key);
        }
        for (listeners, entry) in &effects.conflicts {
            for listener in listeners {
                listener(entry);
            }
        }
        for key in &effects.resync {
            if let Err(e) = self.transport.resync(key) {
                warn!("Resync of {} failed: {}", key, e);
            }
        }
    }

    /// Delivers queued values for `key` until its outbox is empty.
    fn drain(&self, key: &EntityKey) {
        loop {
            let delivery = self.lock().registry.next_delivery(key);
            match delivery {
                Some(delivery) => delivery.dispatch(),
                None => break,
            }
        }
    }
}

impl<P: Payload> DeliveryTarget<P> for EngineInner<P> {
    fn deliver(&self, key: &EntityKey, payload: P, version: Version) {
        self.on_authoritative_update(key, payload, version);
    }
}

impl<P: Payload> ListenerOwner for EngineInner<P> {
    fn detach(&self, kind: ListenerKind, id: ListenerId) -> bool {
        let mut st = self.lock();
        match kind {
            ListenerKind::Conflict => st.conflicts.remove_listener(id),
            ListenerKind::Sync => st.sync.remove_listener(id),
        }
    }
}

impl<P: Payload> Drop for EngineInner<P> {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        st.tracker.cancel_all_timers();
        for key in st.registry.feed_keys() {
            if st.registry.discard_feed(&key).is_some() {
                self.transport.close_feed(&key);
            }
        }
    }
}
