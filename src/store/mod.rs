//! Counter stores.
//!
//! A [`CounterStore`] keeps one [`UsageRecord`] per storage key. The
//! [`LocalStore`] lives in process memory; the [`DistributedStore`] delegates
//! to a shared cache through the [`AtomicCache`] capability.

mod cache;
mod distributed;
mod local;
mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;

pub use cache::{AtomicCache, CacheError, CachedWindow, MemoryCache};
pub use distributed::{DistributedStore, DEFAULT_OPERATION_TIMEOUT};
pub use local::{LocalStore, DEFAULT_CAPACITY};
pub use redis_cache::{RedisCache, DEFAULT_KEY_PREFIX};

use crate::error::Result;
use crate::ratelimit::{StorageKey, UsageRecord};

/// Trait for counter store implementations.
///
/// This trait abstracts over the local and distributed stores so the limiter
/// can work with either. Every operation applies lazy expiry: a record whose
/// window has passed is treated as absent.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically register one hit for `key` and return the updated record.
    ///
    /// Absent or expired records restart with a fresh window of length
    /// `window` beginning now. Concurrent calls for the same key observe a
    /// single linear history of counts.
    async fn increment(&self, key: &StorageKey, window: Duration) -> Result<UsageRecord>;

    /// Read the record for `key` without registering a hit.
    async fn get(&self, key: &StorageKey) -> Result<Option<UsageRecord>>;

    /// Forget `key`, as if it had never been seen.
    async fn reset(&self, key: &StorageKey) -> Result<()>;
}
