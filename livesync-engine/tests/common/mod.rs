//! Shared helpers for engine tests.

#![allow(dead_code)]

use livesync_engine::transport::mock::MockTransport;
use livesync_engine::{EngineConfig, EntityKey, SyncEngine};
use serde_json::Value;
use std::sync::{Arc, Mutex, Once};

static INIT: Once = Once::new();

/// Installs a test tracing subscriber once per process. `RUST_LOG` controls
/// verbosity.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn bot_key() -> EntityKey {
    EntityKey::new("bot", "bot-1")
}

pub fn make_engine() -> (SyncEngine<Value>, Arc<MockTransport<Value>>) {
    make_engine_with_config(EngineConfig::default())
}

pub fn make_engine_with_config(
    config: EngineConfig,
) -> (SyncEngine<Value>, Arc<MockTransport<Value>>) {
    init_tracing();
    let transport = Arc::new(MockTransport::<Value>::new());
    let engine = SyncEngine::new(transport.clone(), config).unwrap();
    (engine, transport)
}

/// Collects every value a listener receives.
#[derive(Clone)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn listener(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |value: &T| seen.lock().unwrap().push(value.clone())
    }

    pub fn values(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<T> {
        self.seen.lock().unwrap().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Lets spawned engine tasks (sync flushes) run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
