//! Feed open/close and publish against transports that take their time or
//! answer out of order.

mod common;

use async_trait::async_trait;
use common::{Recorder, bot_key, init_tracing};
use livesync_engine::transport::mock::MockTransport;
use livesync_engine::{
    EngineConfig, EngineError, EngineResult, EntityKey, EntityTransport, Payload, SyncEngine,
    UpdateStatus, UpstreamSink, Version,
};
use livesync_model::json_patch;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type JsonPatch = <Value as Payload>::Patch;

/// Blocks in `close_feed` before forwarding it.
struct SlowClose {
    inner: MockTransport<Value>,
    delay: Duration,
}

#[async_trait]
impl EntityTransport<Value> for SlowClose {
    fn open_feed(&self, key: &EntityKey, sink: UpstreamSink<Value>) -> EngineResult<()> {
        self.inner.open_feed(key, sink)
    }

    fn close_feed(&self, key: &EntityKey) {
        std::thread::sleep(self.delay);
        self.inner.close_feed(key);
    }

    async fn publish(&self, key: &EntityKey, patch: &JsonPatch) -> EngineResult<()> {
        self.inner.publish(key, patch).await
    }
}

/// Blocks in `open_feed` and refuses the first attempt.
struct FlakyOpen {
    inner: MockTransport<Value>,
    attempts: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl EntityTransport<Value> for FlakyOpen {
    fn open_feed(&self, key: &EntityKey, sink: UpstreamSink<Value>) -> EngineResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if attempt == 0 {
            return Err(EngineError::Transport(format!("{key} refused")));
        }
        self.inner.open_feed(key, sink)
    }

    fn close_feed(&self, key: &EntityKey) {
        self.inner.close_feed(key);
    }

    async fn publish(&self, key: &EntityKey, patch: &JsonPatch) -> EngineResult<()> {
        self.inner.publish(key, patch).await
    }
}

/// Delivers a snapshot from inside `open_feed`, before returning.
struct EagerOpen {
    inner: MockTransport<Value>,
    initial: Mutex<Option<(Value, u64)>>,
}

#[async_trait]
impl EntityTransport<Value> for EagerOpen {
    fn open_feed(&self, key: &EntityKey, sink: UpstreamSink<Value>) -> EngineResult<()> {
        let initial = self.initial.lock().unwrap().take();
        if let Some((value, version)) = initial {
            sink.deliver(value, Version::new(version));
        }
        self.inner.open_feed(key, sink)
    }

    fn close_feed(&self, key: &EntityKey) {
        self.inner.close_feed(key);
    }

    async fn publish(&self, key: &EntityKey, patch: &JsonPatch) -> EngineResult<()> {
        self.inner.publish(key, patch).await
    }
}

/// Pushes the confirming snapshot while the publish is in flight, then
/// reports the publish as failed.
#[derive(Default)]
struct ConfirmsThenFails {
    sinks: Mutex<HashMap<EntityKey, UpstreamSink<Value>>>,
    reply: Mutex<Option<(Value, u64)>>,
}

impl ConfirmsThenFails {
    fn push(&self, key: &EntityKey, value: Value, version: u64) -> bool {
        let sink = self.sinks.lock().unwrap().get(key).cloned();
        sink.is_some_and(|sink| sink.deliver(value, Version::new(version)))
    }
}

#[async_trait]
impl EntityTransport<Value> for ConfirmsThenFails {
    fn open_feed(&self, key: &EntityKey, sink: UpstreamSink<Value>) -> EngineResult<()> {
        self.sinks.lock().unwrap().insert(key.clone(), sink);
        Ok(())
    }

    fn close_feed(&self, key: &EntityKey) {
        self.sinks.lock().unwrap().remove(key);
    }

    async fn publish(&self, key: &EntityKey, _patch: &JsonPatch) -> EngineResult<()> {
        let reply = self.reply.lock().unwrap().take();
        if let Some((value, version)) = reply {
            self.push(key, value, version);
        }
        Err(EngineError::PublishFailure(format!("ack for {key} lost")))
    }
}

fn engine_on<T: EntityTransport<Value> + 'static>(
    transport: &Arc<T>,
    config: EngineConfig,
) -> SyncEngine<Value> {
    init_tracing();
    SyncEngine::new(transport.clone(), config).unwrap()
}

// ── Close in flight ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubscribe_while_closing_waits_and_reopens() {
    let transport = Arc::new(SlowClose {
        inner: MockTransport::new(),
        delay: Duration::from_millis(300),
    });
    let engine = engine_on(
        &transport,
        EngineConfig {
            teardown_grace_ms: 50,
            ..Default::default()
        },
    );
    let id = engine.subscribe("bot", "bot-1", |_: &Value| {}).unwrap();
    assert!(transport.inner.push(&bot_key(), json!({"n": 1}), 1));
    engine.unsubscribe(id).unwrap();

    // The grace period has run out and close_feed is still blocking.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let seen = Recorder::new();
    let subscriber = engine.clone();
    let listener = seen.listener();
    tokio::task::spawn_blocking(move || subscriber.subscribe("bot", "bot-1", listener))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(transport.inner.close_count(&bot_key()), 1);
    assert_eq!(transport.inner.open_count(&bot_key()), 2);
    assert!(transport.inner.is_open(&bot_key()));
    assert!(engine.has_feed(&bot_key()));
    assert_eq!(engine.feed_ref_count(&bot_key()), 1);

    assert!(transport.inner.push(&bot_key(), json!({"n": 2}), 2));
    assert_eq!(seen.values(), vec![json!({"n": 1}), json!({"n": 2})]);
}

// ── Open in flight ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_arriving_during_failed_open_gets_its_own_feed() {
    let transport = Arc::new(FlakyOpen {
        inner: MockTransport::new(),
        attempts: AtomicUsize::new(0),
        delay: Duration::from_millis(200),
    });
    let engine = engine_on(&transport, EngineConfig::default());

    let first_engine = engine.clone();
    let first = tokio::task::spawn_blocking(move || {
        first_engine.subscribe("bot", "bot-1", |_: &Value| {})
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second_engine = engine.clone();
    let second = tokio::task::spawn_blocking(move || {
        second_engine.subscribe("bot", "bot-1", |_: &Value| {})
    });

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert!(matches!(first, Err(EngineError::Transport(_))));
    assert!(second.is_ok());
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    assert!(transport.inner.is_open(&bot_key()));
    assert!(engine.has_feed(&bot_key()));
    assert_eq!(engine.feed_ref_count(&bot_key()), 1);
    assert_eq!(engine.subscriber_count(&bot_key()), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_pushed_while_opening_follows_cached_value() {
    let transport = Arc::new(EagerOpen {
        inner: MockTransport::new(),
        initial: Mutex::new(None),
    });
    let engine = engine_on(&transport, EngineConfig::default());
    let id = engine.subscribe("bot", "bot-1", |_: &Value| {}).unwrap();
    transport.inner.push(&bot_key(), json!({"n": 1}), 1);
    engine.unsubscribe(id).unwrap();
    tokio::time::sleep(engine.config().teardown_grace() + Duration::from_millis(10)).await;
    assert!(!engine.has_feed(&bot_key()));

    *transport.initial.lock().unwrap() = Some((json!({"n": 2}), 2));
    let seen = Recorder::new();
    engine.subscribe("bot", "bot-1", seen.listener()).unwrap();

    assert_eq!(seen.values(), vec![json!({"n": 1}), json!({"n": 2})]);
    assert_eq!(engine.cached_entry(&bot_key()).unwrap().version, Version::new(2));
}

#[tokio::test]
async fn snapshot_pushed_while_opening_reaches_first_subscriber() {
    let transport = Arc::new(EagerOpen {
        inner: MockTransport::new(),
        initial: Mutex::new(Some((json!({"n": 1}), 1))),
    });
    let engine = engine_on(&transport, EngineConfig::default());

    let seen = Recorder::new();
    engine.subscribe("bot", "bot-1", seen.listener()).unwrap();

    assert_eq!(seen.values(), vec![json!({"n": 1})]);
    assert!(transport.inner.push(&bot_key(), json!({"n": 2}), 2));
    assert_eq!(seen.len(), 2);
}

// ── Publish ──────────────────────────────────────────────────────

#[tokio::test]
async fn publish_failure_after_confirmation_keeps_commit() {
    let transport = Arc::new(ConfirmsThenFails::default());
    let engine = engine_on(&transport, EngineConfig::default());
    let seen = Recorder::new();
    engine.subscribe("bot", "bot-1", seen.listener()).unwrap();
    assert!(transport.push(&bot_key(), json!({"status": "active"}), 1));
    *transport.reply.lock().unwrap() = Some((json!({"status": "paused"}), 2));

    let id = engine
        .apply_optimistic_update("bot", "bot-1", json_patch(json!({"status": "paused"})), None)
        .await
        .unwrap();

    assert_eq!(engine.update_status(id), Some(UpdateStatus::Committed));
    assert!(engine.pending_update(&bot_key()).is_none());
    assert_eq!(engine.cached_entry(&bot_key()).unwrap().version, Version::new(2));
    assert_eq!(seen.last(), Some(json!({"status": "paused"})));
    assert_eq!(engine.sync_state().pending_updates, 0);
}

#[tokio::test]
async fn publish_failure_without_confirmation_still_fails() {
    let transport = Arc::new(ConfirmsThenFails::default());
    let engine = engine_on(&transport, EngineConfig::default());
    engine.subscribe("bot", "bot-1", |_: &Value| {}).unwrap();
    assert!(transport.push(&bot_key(), json!({"status": "active"}), 1));

    let err = engine
        .apply_optimistic_update("bot", "bot-1", json_patch(json!({"status": "paused"})), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::PublishFailure(ref msg) if msg.contains("lost")));
    assert_eq!(engine.visible_value(&bot_key()), Some(json!({"status": "active"})));
}
