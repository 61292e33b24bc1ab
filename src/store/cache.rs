//! Shared cache capability used by the distributed store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::sweeper::Sweep;

/// Errors raised by a shared cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache transport error: {0}")]
    Transport(String),
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unexpected cache response: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError {
            CacheError::Protocol(err.to_string())
        } else {
            CacheError::Transport(err.to_string())
        }
    }
}

/// A window counter as held by the cache. Times are Unix epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedWindow {
    pub count: u64,
    pub window_start_ms: i64,
    pub reset_at_ms: i64,
}

impl CachedWindow {
    fn fresh(now_ms: i64, window_ms: i64) -> Self {
        Self {
            count: 1,
            window_start_ms: now_ms,
            reset_at_ms: now_ms.saturating_add(window_ms),
        }
    }

    /// Whether the window has rolled over at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.reset_at_ms
    }

    /// Apply one hit at `now_ms`. This is the transaction every backend runs atomically.
    pub fn hit(current: Option<Self>, now_ms: i64, window_ms: i64) -> Self {
        match current {
            Some(mut window) if !window.is_expired(now_ms) => {
                window.count = window.count.saturating_add(1);
                window
            }
            _ => Self::fresh(now_ms, window_ms),
        }
    }
}

/// A key-value cache offering an atomic read-modify-write on window counters.
///
/// `increment_window` must run as a single server-side transaction: read the
/// current window, apply [`CachedWindow::hit`], write it back with a time to
/// live equal to the remaining window, and return the result, with no other
/// transaction on the same key interleaving.
#[async_trait]
pub trait AtomicCache: Send + Sync {
    async fn increment_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<CachedWindow, CacheError>;

    /// Read a window without modifying it. Expired windows may still be returned.
    async fn fetch(&self, key: &str) -> Result<Option<CachedWindow>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// An in-process [`AtomicCache`].
///
/// Each key's transaction runs under its shard lock. Share one instance
/// between several distributed stores to model nodes of one deployment.
/// Rolled-over windows stay until swept; run [`crate::sweeper::spawn`] over a
/// shared instance in place of the key expiry a real cache server provides.
#[derive(Debug)]
pub struct MemoryCache {
    windows: DashMap<String, CachedWindow>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache whose sweeps judge expiry by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Number of keys held, expired or not.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop windows that have rolled over at `now_ms`.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now_ms));
        before.saturating_sub(self.windows.len())
    }
}

impl Sweep for MemoryCache {
    fn sweep(&self) -> usize {
        self.purge_expired(self.clock.now().timestamp_millis())
    }
}

#[async_trait]
impl AtomicCache for MemoryCache {
    async fn increment_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<CachedWindow, CacheError> {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| CachedWindow {
                count: 0,
                window_start_ms: now_ms,
                reset_at_ms: now_ms,
            });
        let updated = CachedWindow::hit(Some(*entry), now_ms, window_ms);
        *entry = updated;
        trace!(key = %key, count = updated.count, "Incremented cached window");
        Ok(updated)
    }

    async fn fetch(&self, key: &str) -> Result<Option<CachedWindow>, CacheError> {
        Ok(self.windows.get(key).map(|window| *window))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.windows.remove(key);
        Ok(())
    }
}
