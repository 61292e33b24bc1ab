//! Redis-backed [`AtomicCache`].
//!
//! The window transaction runs as a Lua script so Redis executes the read,
//! update, write and expiry of a key without interleaving other clients.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{info, trace};

use super::cache::{AtomicCache, CacheError, CachedWindow};

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "ratekeeper:";

const INCREMENT_WINDOW: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'count', 'start', 'reset_at')
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local count = tonumber(fields[1])
local start = tonumber(fields[2])
local reset_at = tonumber(fields[3])

if count == nil or reset_at == nil or reset_at <= now then
  count = 1
  start = now
  reset_at = now + window
else
  count = count + 1
end

redis.call('HSET', KEYS[1], 'count', count, 'start', start, 'reset_at', reset_at)
redis.call('PEXPIRE', KEYS[1], reset_at - now)
return {count, start, reset_at}
"#;

/// Shared window counters held in Redis.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    key_prefix: String,
    script: Script,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCache {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let key_prefix = key_prefix.into();

        info!(key_prefix = %key_prefix, "Connected to Redis counter cache");

        Ok(Self {
            conn,
            key_prefix,
            script: Script::new(INCREMENT_WINDOW),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl AtomicCache for RedisCache {
    async fn increment_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<CachedWindow, CacheError> {
        let mut conn = self.conn.clone();
        let full_key = self.full_key(key);

        let (count, window_start_ms, reset_at_ms): (u64, i64, i64) = self
            .script
            .key(&full_key)
            .arg(now_ms)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %full_key, count = count, "Incremented Redis window");

        Ok(CachedWindow {
            count,
            window_start_ms,
            reset_at_ms,
        })
    }

    async fn fetch(&self, key: &str) -> Result<Option<CachedWindow>, CacheError> {
        let mut conn = self.conn.clone();

        let (count, start, reset_at): (Option<u64>, Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(self.full_key(key))
            .arg("count")
            .arg("start")
            .arg("reset_at")
            .query_async(&mut conn)
            .await?;

        Ok(match (count, start, reset_at) {
            (Some(count), Some(window_start_ms), Some(reset_at_ms)) => Some(CachedWindow {
                count,
                window_start_ms,
                reset_at_ms,
            }),
            _ => None,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
