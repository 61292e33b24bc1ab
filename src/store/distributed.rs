//! Distributed counter store backed by a shared cache.
//!
//! All mutual exclusion is delegated to the cache's atomic window
//! transaction; this process never holds a lock across a network call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::cache::{AtomicCache, CacheError, CachedWindow};
use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{StorageKey, UsageRecord};

/// Default bound on a single cache operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// A counter store shared by every node talking to the same cache.
///
/// Each node stamps transactions with its own clock, so clock skew between
/// nodes shifts window boundaries by at most the skew.
pub struct DistributedStore {
    cache: Arc<dyn AtomicCache>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl std::fmt::Debug for DistributedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedStore")
            .field("clock", &self.clock)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl DistributedStore {
    /// Create a store over `cache` using the system clock.
    pub fn new(cache: Arc<dyn AtomicCache>) -> Self {
        Self {
            cache,
            clock: Arc::new(SystemClock),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound every cache operation by `timeout`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    async fn bounded<T, F>(&self, key: &StorageKey, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, CacheError>>,
    {
        let outcome = match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.operation_timeout)),
        };
        outcome.map_err(|e| {
            debug!(key = %key, error = %e, "Counter cache operation failed");
            RateKeeperError::StoreUnavailable(e.to_string())
        })
    }
}

fn to_record(window: CachedWindow) -> Result<UsageRecord> {
    let window_start = from_millis(window.window_start_ms)?;
    let reset_at = from_millis(window.reset_at_ms)?;
    Ok(UsageRecord {
        hit_count: window.count,
        window_start,
        reset_at,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        RateKeeperError::StoreUnavailable(
            CacheError::Protocol(format!("timestamp {} out of range", ms)).to_string(),
        )
    })
}

#[async_trait]
impl CounterStore for DistributedStore {
    async fn increment(&self, key: &StorageKey, window: Duration) -> Result<UsageRecord> {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let cached = self
            .bounded(key, self.cache.increment_window(key.as_str(), now_ms, window_ms))
            .await?;

        trace!(key = %key, count = cached.count, "Incremented distributed counter");
        to_record(cached)
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<UsageRecord>> {
        let now = self.clock.now();
        let cached = self.bounded(key, self.cache.fetch(key.as_str())).await?;

        match cached {
            Some(window) if !window.is_expired(now.timestamp_millis()) => Ok(Some(to_record(window)?)),
            _ => Ok(None),
        }
    }

    async fn reset(&self, key: &StorageKey) -> Result<()> {
        self.bounded(key, self.cache.delete(key.as_str())).await
    }
}
