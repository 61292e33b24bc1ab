//! Process-local counter store with bounded capacity.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{StorageKey, UsageRecord};
use crate::sweeper::Sweep;

/// Default number of keys a local store holds.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// In-memory counter store.
///
/// Holds at most `capacity` keys; inserting a new key into a full store first
/// evicts the least recently used one. Reads and writes both refresh recency.
/// Every operation is a single critical section under one lock.
#[derive(Debug)]
pub struct LocalStore {
    entries: Mutex<LruCache<StorageKey, UsageRecord>>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Create a store holding up to `capacity` keys.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            RateKeeperError::Config("local store capacity must be positive".into())
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock,
        })
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of keys held.
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Whether `key` is held, without refreshing its recency.
    pub fn contains(&self, key: &StorageKey) -> bool {
        self.entries.lock().contains(key)
    }

    fn increment_sync(&self, key: &StorageKey, window: Duration) -> UsageRecord {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(record) = entries.get_mut(key) {
            record.hit(now, window);
            trace!(key = %key, hits = record.hit_count, "Incremented local counter");
            return *record;
        }

        if entries.len() >= entries.cap().get() {
            if let Some((evicted, _)) = entries.pop_lru() {
                debug!(evicted = %evicted, "Local store full, evicted least recently used key");
            }
        }

        let record = UsageRecord::first_hit(now, window);
        entries.put(key.clone(), record);
        trace!(key = %key, "Created local counter");
        record
    }

    fn get_sync(&self, key: &StorageKey) -> Option<UsageRecord> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(record) if !record.is_expired(now) => return Some(*record),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn increment(&self, key: &StorageKey, window: Duration) -> Result<UsageRecord> {
        Ok(self.increment_sync(key, window))
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<UsageRecord>> {
        Ok(self.get_sync(key))
    }

    async fn reset(&self, key: &StorageKey) -> Result<()> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

impl Sweep for LocalStore {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let expired: Vec<StorageKey> = entries
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }
}
