//! Wall-clock abstraction.
//!
//! The engine stamps cache entries, subscriptions, optimistic updates and
//! conflicts through an injected [`Clock`] so tests can control time.
//! Timer scheduling itself goes through Tokio's time driver.

use livesync_types::Timestamp;

/// A source of wall-clock timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A manually driven clock for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// A clock that only moves when told to.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        millis: AtomicU64,
    }

    impl ManualClock {
        /// Creates a clock reading `start`.
        pub fn new(start: Timestamp) -> Self {
            Self {
                millis: AtomicU64::new(start.as_millis()),
            }
        }

        /// Moves the clock forward.
        pub fn advance(&self, by: Duration) {
            let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
            self.millis.fetch_add(millis, Ordering::SeqCst);
        }

        /// Sets the clock to an exact time.
        pub fn set(&self, to: Timestamp) {
            self.millis.store(to.as_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
        }
    }
}
