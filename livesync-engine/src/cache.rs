//! Entity cache.
//!
//! Holds the last known authoritative value per entity key together with
//! hit/miss/eviction counters. Unbounded by default; with a capacity set,
//! the least recently used entry is evicted on overflow.
//!
//! Entries are kept in an `IndexMap` ordered by recency: lookups and writes
//! move an entry to the back, eviction pops the front.

use indexmap::IndexMap;
use livesync_types::{EntityKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tracing::{debug, warn};

/// The canonical (server-confirmed) value of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<P> {
    pub key: EntityKey,
    pub value: P,
    pub version: Version,
    pub updated_at: Timestamp,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Distinct entity keys currently cached.
    pub size: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    /// Hit rate (0.0–1.0). Returns 0.0 if no lookups yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Result of a [`EntityCache::put`].
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome<P> {
    /// A new key was cached. Carries the entry evicted to make room, if any.
    Inserted { evicted: Option<CacheEntry<P>> },
    /// An existing entry was overwritten.
    Updated { previous: Version },
    /// The write carried a lower version than the stored one and was dropped.
    Stale { current: Version },
}

impl<P> PutOutcome<P> {
    /// Whether the value was written.
    pub fn is_applied(&self) -> bool {
        !matches!(self, PutOutcome::Stale { .. })
    }
}

/// Last known authoritative value per entity key.
#[derive(Debug)]
pub struct EntityCache<P> {
    entries: IndexMap<EntityKey, CacheEntry<P>>,
    capacity: Option<NonZeroUsize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<P: Clone> EntityCache<P> {
    /// Creates a cache. `None` means unbounded.
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Creates an unbounded cache.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Looks up an entry, counting a hit or a miss and refreshing recency.
    pub fn get(&mut self, key: &EntityKey) -> Option<&CacheEntry<P>> {
        match self.entries.get_index_of(key) {
            Some(index) => {
                self.hits += 1;
                let last = self.entries.len() - 1;
                self.entries.move_index(index, last);
                self.entries.get_index(last).map(|(_, entry)| entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Looks up an entry without touching counters or recency.
    pub fn peek(&self, key: &EntityKey) -> Option<&CacheEntry<P>> {
        self.entries.get(key)
    }

    /// Writes a value. Versions lower than the stored one are rejected and
    /// counted as neither hit nor miss.
    pub fn put(
        &mut self,
        key: EntityKey,
        value: P,
        version: Version,
        now: Timestamp,
    ) -> PutOutcome<P> {
        if let Some(entry) = self.entries.get_mut(&key) {
            if version < entry.version {
                warn!(
                    "Stale write for {} dropped: {} < stored {}",
                    key, version, entry.version
                );
                return PutOutcome::Stale {
                    current: entry.version,
                };
            }
            let previous = entry.version;
            entry.value = value;
            entry.version = version;
            entry.updated_at = now;
            self.touch(&key);
            return PutOutcome::Updated { previous };
        }

        let evicted = match self.capacity {
            Some(capacity) if self.entries.len() >= capacity.get() => {
                self.evictions += 1;
                self.entries.shift_remove_index(0).map(|(evicted_key, entry)| {
                    debug!("Evicted {} to make room for {}", evicted_key, key);
                    entry
                })
            }
            _ => None,
        };

        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                version,
                updated_at: now,
            },
        );
        PutOutcome::Inserted { evicted }
    }

    fn touch(&mut self, key: &EntityKey) {
        if let Some(index) = self.entries.get_index_of(key) {
            let last = self.entries.len() - 1;
            self.entries.move_index(index, last);
        }
    }

    /// Whether `key` is cached.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity, if bounded.
    pub fn capacity(&self) -> Option<NonZeroUsize> {
        self.capacity
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            hit_count: self.hits,
            miss_count: self.misses,
            eviction_count: self.evictions,
        }
    }

    /// Cached keys, least recently used first.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }
}
