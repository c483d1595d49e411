use livesync_engine::registry::{DataListener, FeedAction, FeedPhase, SubscriptionRegistry};
use livesync_types::{EntityKey, SubscriptionId, Timestamp};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

fn key(id: &str) -> EntityKey {
    EntityKey::new("bot", id)
}

fn now() -> Timestamp {
    Timestamp::from_millis(1_000)
}

fn recording(log: &Arc<Mutex<Vec<(&'static str, u32)>>>, name: &'static str) -> DataListener<u32> {
    let log = log.clone();
    Arc::new(move |value: &u32| log.lock().unwrap().push((name, *value)))
}

fn noop() -> DataListener<u32> {
    Arc::new(|_: &u32| {})
}

fn drain(registry: &mut SubscriptionRegistry<u32>, key: &EntityKey) {
    while let Some(delivery) = registry.next_delivery(key) {
        delivery.dispatch();
    }
}

// ── Registration ─────────────────────────────────────────────────

#[test]
fn first_registration_opens_feed() {
    let mut registry = SubscriptionRegistry::new();

    let (_, first) = registry.register(key("a"), noop(), now());
    let (_, second) = registry.register(key("a"), noop(), now());

    assert_eq!(first, FeedAction::Open);
    assert_eq!(second, FeedAction::Reused);
    assert_eq!(registry.feed(&key("a")).unwrap().ref_count, 2);
    assert_eq!(registry.feed(&key("a")).unwrap().opened_at, now());
    assert_eq!(registry.live_feed_count(), 1);
    assert_eq!(registry.subscription_count(), 2);
}

#[test]
fn ref_count_matches_live_subscriptions() {
    let mut registry = SubscriptionRegistry::new();
    let ids: Vec<SubscriptionId> = (0..4)
        .map(|_| registry.register(key("a"), noop(), now()).0)
        .collect();

    for (removed, id) in ids.iter().enumerate() {
        let (k, remaining) = registry.remove(*id).unwrap();
        assert_eq!(k, key("a"));
        assert_eq!(remaining, ids.len() - removed - 1);
        assert_eq!(registry.subscriber_count(&key("a")), remaining);
        assert_eq!(registry.feed(&key("a")).unwrap().ref_count, remaining);
    }
}

#[test]
fn removing_unknown_subscription_returns_none() {
    let mut registry = SubscriptionRegistry::<u32>::new();
    assert!(registry.remove(SubscriptionId::new()).is_none());
}

#[test]
fn subscription_key_lookup() {
    let mut registry = SubscriptionRegistry::new();
    let (id, _) = registry.register(key("a"), noop(), now());

    assert_eq!(registry.subscription_key(id), Some(&key("a")));
    registry.remove(id);
    assert_eq!(registry.subscription_key(id), None);
}

// ── Feed lifecycle ───────────────────────────────────────────────

fn live(registry: &mut SubscriptionRegistry<u32>, id: &str) -> SubscriptionId {
    let (sub, action) = registry.register(key(id), noop(), now());
    if action == FeedAction::Open {
        registry.mark_live(&key(id));
    }
    sub
}

#[test]
fn new_feed_is_in_transition_until_live() {
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), noop(), now());

    assert_eq!(registry.feed(&key("a")).unwrap().phase, FeedPhase::Opening);
    assert!(registry.feed_in_transition(&key("a")));

    registry.mark_live(&key("a"));
    assert_eq!(registry.feed(&key("a")).unwrap().phase, FeedPhase::Live);
    assert!(!registry.feed_in_transition(&key("a")));
}

#[test]
fn teardown_only_arms_for_idle_feed() {
    let mut registry = SubscriptionRegistry::new();
    let id = live(&mut registry, "a");

    assert!(registry.begin_teardown(&key("a")).is_none());
    registry.remove(id);
    let token = registry.begin_teardown(&key("a")).unwrap();
    assert!(registry.feed(&key("a")).unwrap().teardown_pending());

    assert!(registry.begin_close(&key("a"), token));
    assert!(registry.feed_in_transition(&key("a")));
    assert!(registry.has_feed(&key("a")));

    let feed = registry.finish_close(&key("a")).unwrap();
    assert_eq!(feed.key, key("a"));
    assert!(!registry.has_feed(&key("a")));
}

#[test]
fn finish_close_ignores_feed_not_closing() {
    let mut registry = SubscriptionRegistry::new();
    live(&mut registry, "a");

    assert!(registry.finish_close(&key("a")).is_none());
    assert!(registry.has_feed(&key("a")));
}

#[test]
fn resubscribe_revives_idle_feed() {
    let mut registry = SubscriptionRegistry::new();
    let id = live(&mut registry, "a");
    registry.remove(id);
    let token = registry.begin_teardown(&key("a")).unwrap();

    let (_, action) = registry.register(key("a"), noop(), now());

    assert_eq!(action, FeedAction::Revived);
    assert!(!registry.feed(&key("a")).unwrap().teardown_pending());
    assert!(!registry.begin_close(&key("a"), token));
    assert!(registry.has_feed(&key("a")));
}

#[test]
fn stale_teardown_token_is_ignored() {
    let mut registry = SubscriptionRegistry::new();
    let id = live(&mut registry, "a");
    registry.remove(id);
    let old = registry.begin_teardown(&key("a")).unwrap();
    let (id, _) = registry.register(key("a"), noop(), now());
    registry.remove(id);
    let new = registry.begin_teardown(&key("a")).unwrap();

    assert_ne!(old, new);
    assert!(!registry.begin_close(&key("a"), old));
    assert!(registry.begin_close(&key("a"), new));
}

#[test]
fn discard_feed_forgets_key() {
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), noop(), now());
    registry.register(key("b"), noop(), now());

    assert!(registry.discard_feed(&key("a")).is_some());

    assert_eq!(registry.feed_keys(), vec![key("b")]);
}

// ── Fan-out ──────────────────────────────────────────────────────

#[test]
fn fanout_reaches_every_subscriber_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), recording(&log, "first"), now());
    registry.register(key("a"), recording(&log, "second"), now());

    assert!(registry.enqueue_fanout(&key("a"), 1));
    assert!(!registry.enqueue_fanout(&key("a"), 2));
    drain(&mut registry, &key("a"));

    assert_eq!(
        *log.lock().unwrap(),
        vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
    );
}

#[test]
fn drainer_role_is_released_when_empty() {
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), noop(), now());

    assert!(registry.enqueue_fanout(&key("a"), 1));
    drain(&mut registry, &key("a"));

    assert!(registry.enqueue_fanout(&key("a"), 2));
}

#[test]
fn enqueue_one_targets_single_subscriber() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), recording(&log, "first"), now());
    let (id, _) = registry.register(key("a"), recording(&log, "second"), now());

    assert!(registry.enqueue_one(id, 7));
    drain(&mut registry, &key("a"));

    assert_eq!(*log.lock().unwrap(), vec![("second", 7)]);
}

#[test]
fn fanout_without_subscribers_is_dropped() {
    let mut registry = SubscriptionRegistry::<u32>::new();
    assert!(!registry.enqueue_fanout(&key("a"), 1));
    assert!(registry.next_delivery(&key("a")).is_none());
}

#[test]
fn claimed_outbox_holds_back_other_enqueuers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), recording(&log, "first"), now());

    assert!(registry.claim_outbox(&key("a")));
    assert!(!registry.claim_outbox(&key("a")));
    assert!(!registry.enqueue_fanout(&key("a"), 1));
    assert!(log.lock().unwrap().is_empty());

    drain(&mut registry, &key("a"));
    assert_eq!(*log.lock().unwrap(), vec![("first", 1)]);
}

#[test]
fn abandoned_outbox_delivers_nothing() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SubscriptionRegistry::new();
    registry.register(key("a"), recording(&log, "first"), now());
    assert!(registry.enqueue_fanout(&key("a"), 1));

    registry.abandon_outbox(&key("a"));

    assert!(registry.next_delivery(&key("a")).is_none());
    assert!(log.lock().unwrap().is_empty());
    assert!(registry.enqueue_fanout(&key("a"), 2));
}
