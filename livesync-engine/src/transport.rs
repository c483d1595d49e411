//! Transport layer abstraction.
//!
//! The engine consumes two things from the outside world: a push source of
//! full authoritative snapshots per entity key, and a request-style publish
//! for optimistic patches. Both sit behind [`EntityTransport`] so the engine
//! works with any backend (socket, relay, in-process test double).

use crate::error::EngineResult;
use async_trait::async_trait;
use livesync_model::Payload;
use livesync_types::{EntityKey, Version};
use std::sync::Weak;

/// Receives authoritative snapshots on behalf of the engine.
pub(crate) trait DeliveryTarget<P: Payload>: Send + Sync {
    fn deliver(&self, key: &EntityKey, payload: P, version: Version);
}

/// Handle a transport uses to push snapshots for one entity key.
///
/// Holds only a weak reference to the engine: deliveries after the engine is
/// dropped are discarded.
pub struct UpstreamSink<P: Payload> {
    key: EntityKey,
    target: Weak<dyn DeliveryTarget<P>>,
}

impl<P: Payload> UpstreamSink<P> {
    pub(crate) fn new(key: EntityKey, target: Weak<dyn DeliveryTarget<P>>) -> Self {
        Self { key, target }
    }

    /// The entity key this sink delivers for.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Delivers a full authoritative snapshot.
    /// Returns `false` if the engine no longer exists.
    pub fn deliver(&self, payload: P, version: Version) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.deliver(&self.key, payload, version);
                true
            }
            None => false,
        }
    }

    /// Whether the engine behind this sink is still alive.
    pub fn is_attached(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl<P: Payload> Clone for UpstreamSink<P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            target: self.target.clone(),
        }
    }
}

impl<P: Payload> std::fmt::Debug for UpstreamSink<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSink")
            .field("key", &self.key)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// The engine's view of the network.
#[async_trait]
pub trait EntityTransport<P: Payload>: Send + Sync {
    /// Starts the push source for `key`. Every snapshot must be handed to
    /// `sink`. Called at most once per key until [`close_feed`] is called.
    ///
    /// [`close_feed`]: EntityTransport::close_feed
    fn open_feed(&self, key: &EntityKey, sink: UpstreamSink<P>) -> EngineResult<()>;

    /// Stops the push source for `key`.
    fn close_feed(&self, key: &EntityKey);

    /// Asks the push source for `key` to send a fresh snapshot.
    fn resync(&self, key: &EntityKey) -> EngineResult<()> {
        let _ = key;
        Ok(())
    }

    /// Sends an optimistic patch to the remote side. The acknowledgement
    /// surfaces later as an authoritative snapshot through the feed.
    async fn publish(&self, key: &EntityKey, patch: &P::Patch) -> EngineResult<()>;
}

/// A mock transport for testing.
pub mod mock {
    use super::*;
    use crate::error::EngineError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    #[derive(Debug)]
    struct Recorded<P: Payload> {
        sinks: HashMap<EntityKey, UpstreamSink<P>>,
        opens: HashMap<EntityKey, usize>,
        closes: HashMap<EntityKey, usize>,
        resyncs: Vec<EntityKey>,
        published: Vec<(EntityKey, P::Patch)>,
    }

    /// Records every call and lets tests push snapshots by hand.
    #[derive(Debug)]
    pub struct MockTransport<P: Payload> {
        recorded: Mutex<Recorded<P>>,
        fail_publish: AtomicBool,
        fail_open: AtomicBool,
    }

    impl<P: Payload> Default for MockTransport<P> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<P: Payload> MockTransport<P> {
        /// Creates a transport that accepts everything.
        pub fn new() -> Self {
            Self {
                recorded: Mutex::new(Recorded {
                    sinks: HashMap::new(),
                    opens: HashMap::new(),
                    closes: HashMap::new(),
                    resyncs: Vec::new(),
                    published: Vec::new(),
                }),
                fail_publish: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
            }
        }

        fn recorded(&self) -> MutexGuard<'_, Recorded<P>> {
            self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Makes subsequent publishes fail.
        pub fn set_fail_publish(&self, fail: bool) {
            self.fail_publish.store(fail, Ordering::SeqCst);
        }

        /// Makes subsequent feed opens fail.
        pub fn set_fail_open(&self, fail: bool) {
            self.fail_open.store(fail, Ordering::SeqCst);
        }

        /// Pushes a snapshot through the open feed for `key`.
        /// Returns `false` if no feed is open.
        pub fn push(&self, key: &EntityKey, payload: P, version: u64) -> bool {
            // Deliver outside the lock: the engine may call back into close_feed.
            let sink = self.recorded().sinks.get(key).cloned();
            match sink {
                Some(sink) => sink.deliver(payload, Version::new(version)),
                None => false,
            }
        }

        /// Whether a feed is currently open for `key`.
        pub fn is_open(&self, key: &EntityKey) -> bool {
            self.recorded().sinks.contains_key(key)
        }

        /// Number of currently open feeds.
        pub fn open_feed_count(&self) -> usize {
            self.recorded().sinks.len()
        }

        /// How many times a feed was opened for `key`.
        pub fn open_count(&self, key: &EntityKey) -> usize {
            self.recorded().opens.get(key).copied().unwrap_or(0)
        }

        /// How many times the feed for `key` was closed.
        pub fn close_count(&self, key: &EntityKey) -> usize {
            self.recorded().closes.get(key).copied().unwrap_or(0)
        }

        /// Keys for which a resync was requested, in order.
        pub fn resyncs(&self) -> Vec<EntityKey> {
            self.recorded().resyncs.clone()
        }

        /// Every patch published so far, in order.
        pub fn published(&self) -> Vec<(EntityKey, P::Patch)> {
            self.recorded().published.clone()
        }
    }

    #[async_trait]
    impl<P: Payload> EntityTransport<P> for MockTransport<P> {
        fn open_feed(&self, key: &EntityKey, sink: UpstreamSink<P>) -> EngineResult<()> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(EngineError::Transport(format!("cannot open feed for {key}")));
            }
            let mut recorded = self.recorded();
            *recorded.opens.entry(key.clone()).or_default() += 1;
            recorded.sinks.insert(key.clone(), sink);
            Ok(())
        }

        fn close_feed(&self, key: &EntityKey) {
            let mut recorded = self.recorded();
            recorded.sinks.remove(key);
            *recorded.closes.entry(key.clone()).or_default() += 1;
        }

        fn resync(&self, key: &EntityKey) -> EngineResult<()> {
            self.recorded().resyncs.push(key.clone());
            Ok(())
        }

        async fn publish(&self, key: &EntityKey, patch: &P::Patch) -> EngineResult<()> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(EngineError::PublishFailure(format!("{key} unreachable")));
            }
            self.recorded().published.push((key.clone(), patch.clone()));
            Ok(())
        }
    }
}
