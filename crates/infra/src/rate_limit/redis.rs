//! Redis-backed rate-limit store.
//!
//! - **Fixed window**: `MULTI INCR EXPIRE EXEC` in one round trip
//! - **Sliding window**: one Lua script over a sorted set, timed by `TIME`
//! - **Clock**: the server's `TIME`, shared by every process

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::instrument;
use uuid::Uuid;

use cadence_core::StoreError;

use super::store::{RateLimitStore, WindowSample};

/// KEYS[1] = sorted-set key, ARGV[1] = window in ms, ARGV[2] = member suffix.
///
/// Returns `{count, now_ms, oldest_ms}`; `oldest_ms` is -1 for an empty set.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', key, now, now .. '-' .. ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
if count > 0 then
  redis.call('PEXPIRE', key, window)
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {count, now, oldest_ms}
"#;

#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: MultiplexedConnection,
    sliding_window: redis::Script,
}

impl std::fmt::Debug for RedisRateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimitStore").finish_non_exhaustive()
    }
}

impl RedisRateLimitStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| map_redis_error("open", e))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            sliding_window: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    #[instrument(skip(self), err)]
    async fn now_millis(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("time", e))?;
        Ok(secs.saturating_mul(1000).saturating_add(micros / 1000))
    }

    #[instrument(skip(self), err)]
    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("incr_with_expiry", e))?;
        Ok(count)
    }

    #[instrument(skip(self), err)]
    async fn record_in_window(&self, key: &str, window_ms: i64) -> Result<WindowSample, StoreError> {
        let mut conn = self.conn.clone();
        // Two calls in the same millisecond must stay distinct set members.
        let member = Uuid::now_v7().simple().to_string();
        let (count, now_ms, oldest_ms): (u64, i64, i64) = self
            .sliding_window
            .key(key)
            .arg(window_ms)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("record_in_window", e))?;

        Ok(WindowSample {
            count,
            now_ms,
            oldest_ms: (oldest_ms >= 0).then_some(oldest_ms),
        })
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> StoreError {
    StoreError::unavailable(format!("redis error in {operation}: {err}"))
}
