//! Real-time entity sync engine.
//!
//! Keeps a local cache of server-authoritative entity values coherent with a
//! push-based upstream, while letting the local side apply optimistic
//! mutations that show up immediately and are later confirmed, rolled back or
//! escalated as conflicts.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Cache**: last known authoritative value per entity key, with stats
//! - **Registry**: multiplexes local listeners onto one upstream feed per key
//! - **Optimistic**: tracks unconfirmed local mutations and their timers
//! - **Conflict**: records divergences and settles them on request
//! - **State**: aggregates pending work into a coalesced sync summary
//! - **Transport**: the engine's view of the network
//! - **Engine**: orchestrates all of the above
//!
//! ## Update flow
//!
//! 1. **Subscribe**: the first listener for a key opens its upstream feed
//! 2. **Predict**: an optimistic patch is applied locally and fanned out
//! 3. **Publish**: the patch is sent to the remote side
//! 4. **Reconcile**: the next authoritative snapshot confirms the prediction
//!    or opens a conflict; a timeout rolls it back
//! 5. **Resolve**: the consumer settles conflicts as local, remote or merge
//!
//! # Example
//!
//! ```
//! use livesync_engine::transport::mock::MockTransport;
//! use livesync_engine::{EngineConfig, EntityKey, SyncEngine};
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let transport = Arc::new(MockTransport::<Value>::new());
//!     let engine = SyncEngine::new(transport.clone(), EngineConfig::default()).unwrap();
//!
//!     engine
//!         .subscribe("bot", "bot-1", |value: &Value| println!("{value}"))
//!         .unwrap();
//!     let key = EntityKey::new("bot", "bot-1");
//!     transport.push(&key, json!({"status": "active"}), 1);
//!     assert_eq!(engine.visible_value(&key), Some(json!({"status": "active"})));
//! });
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
mod engine;
mod error;
pub mod optimistic;
pub mod registry;
pub mod state;
pub mod transport;

pub use cache::{CacheEntry, CacheStats, EntityCache, PutOutcome};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use conflict::{ConflictEntry, ConflictManager, ConflictStatus, Resolution};
pub use engine::{ListenerHandle, ListenerKind, SyncEngine};
pub use error::{EngineError, EngineResult};
pub use optimistic::{OptimisticTracker, RollbackReason, UpdateSnapshot, UpdateStatus};
pub use registry::{FeedAction, FeedPhase, SubscriptionRegistry};
pub use state::{ConnectionStatus, SyncAggregator, SyncState};
pub use transport::{EntityTransport, UpstreamSink};

pub use livesync_model::Payload;
pub use livesync_types::{ConflictId, EntityKey, SubscriptionId, UpdateId, Version};
