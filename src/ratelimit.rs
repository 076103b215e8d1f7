use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// Sliding-window counter storage. At most `limit` calls with the same key
/// may return `true` within any trailing `window`. On backend error the
/// caller decides policy; the store only reports.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool, StoreError>;
}

/// In-memory backend: per-key vectors of monotonic-nanosecond timestamps
/// behind one mutex. Critical sections are O(entries in window).
pub struct MemoryStore {
    epoch: Instant,
    windows: Mutex<HashMap<String, Vec<u64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool, StoreError> {
        if limit <= 0 || window.is_zero() {
            return Ok(false);
        }

        let now = self.now_nanos();
        let window_start = now.saturating_sub(window.as_nanos() as u64);

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let timestamps = windows.entry(key.to_string()).or_default();
        timestamps.retain(|&ts| ts > window_start);

        if timestamps.len() as i64 >= limit {
            return Ok(false);
        }

        timestamps.push(now);
        Ok(true)
    }
}

// The same algorithm executed atomically on the server: prune the sorted
// set, count, then either deny or record the call and refresh expiry
// (window + 1s buffer). A client-side two-step version would race.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local window_start = now - window

redis.call('ZREMRANGEBYSCORE', key, 0, window_start)

local current_count = redis.call('ZCARD', key)
if current_count >= limit then
  return 0
end

redis.call('ZADD', key, now, now)
redis.call('PEXPIRE', key, math.floor(window / 1000000) + 1000)

return 1
"#;

/// Redis backend running the sliding-window check as one atomic script.
pub struct RedisStore {
    client: redis::Client,
    script: redis::Script,
}

impl RedisStore {
    pub fn new(address: &str) -> Result<Self, StoreError> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{}", address)
        };
        let client = redis::Client::open(url)
            .map_err(|e| StoreError(format!("redis client error: {}", e)))?;
        Ok(Self {
            client,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<bool, StoreError> {
        if limit <= 0 || window.is_zero() {
            return Ok(false);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError(format!("redis connect error: {}", e)))?;

        let allowed: i64 = self
            .script
            .key(key)
            .arg(now)
            .arg(window.as_nanos() as u64)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError(format!("redis script error: {}", e)))?;

        Ok(allowed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(store.allow("k", 3, window).await.expect("ok"));
        }
        assert!(!store.allow("k", 3, window).await.expect("ok"));
        assert!(!store.allow("k", 3, window).await.expect("ok"));
    }

    #[tokio::test]
    async fn denied_calls_do_not_consume_slots() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(80);

        assert!(store.allow("k", 1, window).await.expect("ok"));
        // Hammering while denied must not extend the window.
        for _ in 0..5 {
            assert!(!store.allow("k", 1, window).await.expect("ok"));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.allow("k", 1, window).await.expect("ok"));
    }

    #[tokio::test]
    async fn window_expiry_frees_slots() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(50);

        assert!(store.allow("k", 1, window).await.expect("ok"));
        assert!(!store.allow("k", 1, window).await.expect("ok"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.allow("k", 1, window).await.expect("ok"));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        assert!(store.allow("a", 1, window).await.expect("ok"));
        assert!(store.allow("b", 1, window).await.expect("ok"));
        assert!(!store.allow("a", 1, window).await.expect("ok"));
    }

    #[tokio::test]
    async fn zero_limit_denies_everything() {
        let store = MemoryStore::new();
        assert!(!store.allow("k", 0, Duration::from_secs(1)).await.expect("ok"));
    }

    #[tokio::test]
    async fn zero_window_denies_everything() {
        let store = MemoryStore::new();
        assert!(!store.allow("k", 5, Duration::ZERO).await.expect("ok"));
    }
}
