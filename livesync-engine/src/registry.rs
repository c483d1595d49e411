//! Subscription registry.
//!
//! Multiplexes any number of local listeners onto a single upstream feed per
//! entity key, and serializes fan-out per key.
//!
//! Each key owns a slot with its subscriptions, its feed record and an
//! outbox of pending deliveries. A feed record outlives the transport call
//! that opens or closes it: while it is [`FeedPhase::Opening`] or
//! [`FeedPhase::Closing`] the key is in transition and the engine holds new
//! registrations back until the call returns.
//! Whoever enqueues into an idle outbox becomes
//! its drainer and delivers until the outbox is empty, outside the engine
//! lock. Later enqueuers for the same key only append, so deliveries for one
//! key are never reordered and listeners may call back into the engine.

use indexmap::IndexMap;
use livesync_types::{EntityKey, SubscriptionId, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Callback receiving the visible value of an entity.
pub type DataListener<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// One local listener registration.
pub struct Subscription<P> {
    pub id: SubscriptionId,
    pub key: EntityKey,
    pub created_at: Timestamp,
    listener: DataListener<P>,
}

impl<P> std::fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A pending teardown of an idle feed.
#[derive(Debug)]
struct TeardownTimer {
    token: u64,
    handle: Option<AbortHandle>,
}

impl TeardownTimer {
    fn cancel(self) {
        if let Some(handle) = self.handle {
            handle.abort();
        }
    }
}

/// Transport-side state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    /// `open_feed` is in flight.
    Opening,
    Live,
    /// `close_feed` is in flight.
    Closing,
}

/// The single upstream feed for an entity key.
#[derive(Debug)]
pub struct UpstreamFeed {
    pub key: EntityKey,
    /// Number of live subscriptions sharing this feed.
    pub ref_count: usize,
    pub opened_at: Timestamp,
    pub phase: FeedPhase,
    teardown: Option<TeardownTimer>,
}

impl UpstreamFeed {
    /// Whether a teardown timer is armed.
    pub fn teardown_pending(&self) -> bool {
        self.teardown.is_some()
    }
}

/// A value waiting to be handed to a set of listeners.
pub struct Delivery<P> {
    pub listeners: Vec<DataListener<P>>,
    pub value: P,
}

impl<P> Delivery<P> {
    /// Invokes every listener with the value.
    pub fn dispatch(self) {
        for listener in &self.listeners {
            listener(&self.value);
        }
    }
}

/// What `register` did to the key's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAction {
    /// No feed existed; the caller must open one.
    Open,
    /// The live feed was shared.
    Reused,
    /// The feed was idle and about to be torn down; the teardown was cancelled.
    Revived,
}

struct KeySlot<P> {
    subscriptions: IndexMap<SubscriptionId, Subscription<P>>,
    feed: Option<UpstreamFeed>,
    outbox: VecDeque<Delivery<P>>,
    draining: bool,
}

impl<P> KeySlot<P> {
    fn new() -> Self {
        Self {
            subscriptions: IndexMap::new(),
            feed: None,
            outbox: VecDeque::new(),
            draining: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.subscriptions.is_empty()
            && self.feed.is_none()
            && self.outbox.is_empty()
            && !self.draining
    }
}

/// Tracks subscriptions and upstream feeds per entity key.
pub struct SubscriptionRegistry<P> {
    slots: HashMap<EntityKey, KeySlot<P>>,
    index: HashMap<SubscriptionId, EntityKey>,
    next_token: u64,
}

impl<P> Default for SubscriptionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> SubscriptionRegistry<P> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            index: HashMap::new(),
            next_token: 0,
        }
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Registers a listener, creating the key's feed record if needed.
    ///
    /// The caller must not register while the key is in transition
    /// (see [`feed_in_transition`]). A new record starts out `Opening`.
    ///
    /// [`feed_in_transition`]: SubscriptionRegistry::feed_in_transition
    pub fn register(
        &mut self,
        key: EntityKey,
        listener: DataListener<P>,
        now: Timestamp,
    ) -> (SubscriptionId, FeedAction) {
        let id = SubscriptionId::new();
        let slot = self.slots.entry(key.clone()).or_insert_with(KeySlot::new);
        slot.subscriptions.insert(
            id,
            Subscription {
                id,
                key: key.clone(),
                created_at: now,
                listener,
            },
        );

        let action = match slot.feed.as_mut() {
            Some(feed) => {
                feed.ref_count += 1;
                match feed.teardown.take() {
                    Some(timer) => {
                        timer.cancel();
                        debug!("Cancelled teardown of feed {}", key);
                        FeedAction::Revived
                    }
                    None => FeedAction::Reused,
                }
            }
            None => {
                slot.feed = Some(UpstreamFeed {
                    key: key.clone(),
                    ref_count: 1,
                    opened_at: now,
                    phase: FeedPhase::Opening,
                    teardown: None,
                });
                FeedAction::Open
            }
        };

        self.index.insert(id, key);
        (id, action)
    }

    /// Removes a subscription. Returns its key and the remaining ref count.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<(EntityKey, usize)> {
        let key = self.index.remove(&id)?;
        let slot = self.slots.get_mut(&key)?;
        slot.subscriptions.shift_remove(&id);
        let remaining = match slot.feed.as_mut() {
            Some(feed) => {
                feed.ref_count = feed.ref_count.saturating_sub(1);
                feed.ref_count
            }
            None => slot.subscriptions.len(),
        };
        self.prune(&key);
        Some((key, remaining))
    }

    /// The key a subscription belongs to.
    pub fn subscription_key(&self, id: SubscriptionId) -> Option<&EntityKey> {
        self.index.get(&id)
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &EntityKey) -> usize {
        self.slots
            .get(key)
            .map(|slot| slot.subscriptions.len())
            .unwrap_or(0)
    }

    /// Total live subscriptions across all keys.
    pub fn subscription_count(&self) -> usize {
        self.index.len()
    }

    // ── Feeds ────────────────────────────────────────────────────

    /// The feed record for `key`, if one is live.
    pub fn feed(&self, key: &EntityKey) -> Option<&UpstreamFeed> {
        self.slots.get(key).and_then(|slot| slot.feed.as_ref())
    }

    pub fn has_feed(&self, key: &EntityKey) -> bool {
        self.feed(key).is_some()
    }

    /// Whether the feed for `key` is being opened or closed.
    pub fn feed_in_transition(&self, key: &EntityKey) -> bool {
        self.feed(key)
            .is_some_and(|feed| feed.phase != FeedPhase::Live)
    }

    /// Marks an `Opening` feed as live once the transport accepted it.
    pub fn mark_live(&mut self, key: &EntityKey) {
        if let Some(feed) = self.slots.get_mut(key).and_then(|slot| slot.feed.as_mut()) {
            feed.phase = FeedPhase::Live;
        }
    }

    /// Number of feed records, whatever their phase.
    pub fn live_feed_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.feed.is_some()).count()
    }

    /// Keys with a live feed.
    pub fn feed_keys(&self) -> Vec<EntityKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.feed.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Arms a teardown for an idle feed. Returns the token the timer must
    /// present to [`begin_close`], or `None` if the feed is not idle.
    ///
    /// [`begin_close`]: SubscriptionRegistry::begin_close
    pub fn begin_teardown(&mut self, key: &EntityKey) -> Option<u64> {
        let token = self.next_token;
        let feed = self.slots.get_mut(key)?.feed.as_mut()?;
        if feed.ref_count > 0 {
            return None;
        }
        if let Some(previous) = feed.teardown.take() {
            previous.cancel();
        }
        feed.teardown = Some(TeardownTimer {
            token,
            handle: None,
        });
        self.next_token += 1;
        Some(token)
    }

    /// Attaches the spawned timer to an armed teardown.
    pub fn attach_teardown_timer(&mut self, key: &EntityKey, token: u64, handle: AbortHandle) {
        let timer = self
            .slots
            .get_mut(key)
            .and_then(|slot| slot.feed.as_mut())
            .and_then(|feed| feed.teardown.as_mut())
            .filter(|timer| timer.token == token);
        match timer {
            Some(timer) => timer.handle = Some(handle),
            None => handle.abort(),
        }
    }

    /// Moves a live feed to `Closing` if it is still idle and its teardown
    /// carries `token`. Returns `false` if the teardown no longer applies.
    pub fn begin_close(&mut self, key: &EntityKey, token: u64) -> bool {
        let Some(feed) = self.slots.get_mut(key).and_then(|slot| slot.feed.as_mut()) else {
            return false;
        };
        let armed = feed.phase == FeedPhase::Live
            && feed.ref_count == 0
            && feed
                .teardown
                .as_ref()
                .is_some_and(|timer| timer.token == token);
        if !armed {
            return false;
        }
        feed.teardown = None;
        feed.phase = FeedPhase::Closing;
        true
    }

    /// Drops a `Closing` feed record once the transport has closed it.
    pub fn finish_close(&mut self, key: &EntityKey) -> Option<UpstreamFeed> {
        let slot = self.slots.get_mut(key)?;
        if slot.feed.as_ref()?.phase != FeedPhase::Closing {
            return None;
        }
        let feed = slot.feed.take();
        self.prune(key);
        feed
    }

    /// Drops the feed record for `key` regardless of its state.
    pub fn discard_feed(&mut self, key: &EntityKey) -> Option<UpstreamFeed> {
        let feed = self.slots.get_mut(key)?.feed.take();
        if let Some(timer) = feed.as_ref().and_then(|f| f.teardown.as_ref()) {
            if let Some(handle) = &timer.handle {
                handle.abort();
            }
        }
        self.prune(key);
        feed
    }

    // ── Fan-out ──────────────────────────────────────────────────

    /// Queues `value` for every current subscriber of `key`.
    /// Returns `true` if the caller became the drainer and must call
    /// [`next_delivery`] until it returns `None`.
    ///
    /// [`next_delivery`]: SubscriptionRegistry::next_delivery
    pub fn enqueue_fanout(&mut self, key: &EntityKey, value: P) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        if slot.subscriptions.is_empty() {
            return false;
        }
        let listeners = slot
            .subscriptions
            .values()
            .map(|sub| sub.listener.clone())
            .collect();
        Self::enqueue(slot, Delivery { listeners, value })
    }

    /// Queues `value` for a single subscription.
    pub fn enqueue_one(&mut self, id: SubscriptionId, value: P) -> bool {
        let Some(key) = self.index.get(&id) else {
            return false;
        };
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        let Some(listener) = slot.subscriptions.get(&id).map(|sub| sub.listener.clone()) else {
            return false;
        };
        Self::enqueue(
            slot,
            Delivery {
                listeners: vec![listener],
                value,
            },
        )
    }

    /// Takes the drainer role for `key` without queueing anything, so that
    /// deliveries arriving meanwhile wait for the caller. Returns `false` if
    /// someone else is draining.
    pub fn claim_outbox(&mut self, key: &EntityKey) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) if !slot.draining => {
                slot.draining = true;
                true
            }
            _ => false,
        }
    }

    /// Drops every queued delivery for `key` and releases the drainer role.
    pub fn abandon_outbox(&mut self, key: &EntityKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.outbox.clear();
            slot.draining = false;
        }
        self.prune(key);
    }

    fn enqueue(slot: &mut KeySlot<P>, delivery: Delivery<P>) -> bool {
        slot.outbox.push_back(delivery);
        if slot.draining {
            false
        } else {
            slot.draining = true;
            true
        }
    }

    /// Pops the next delivery for `key`. When the outbox is empty the drainer
    /// role is released and `None` is returned.
    pub fn next_delivery(&mut self, key: &EntityKey) -> Option<Delivery<P>> {
        let slot = self.slots.get_mut(key)?;
        match slot.outbox.pop_front() {
            Some(delivery) => Some(delivery),
            None => {
                slot.draining = false;
                self.prune(key);
                None
            }
        }
    }

    fn prune(&mut self, key: &EntityKey) {
        if self.slots.get(key).is_some_and(KeySlot::is_idle) {
            self.slots.remove(key);
        }
    }
}
