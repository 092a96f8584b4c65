//! Distributed rate limiting over a shared atomic store.
//!
//! ## Components
//!
//! - `RateLimitStore`: atomic primitives (Redis, or in-memory for tests)
//! - `FixedWindowLimiter`: counter per discrete time bucket
//! - `SlidingWindowLimiter`: sorted-set log over a moving interval
//!
//! Neither limiter keeps state in the process beyond its store handle, so any
//! number of processes sharing one store enforce one limit.

pub mod fixed_window;
pub mod sliding_window;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis;

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{StoreError, UserId, ValidationError};

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use store::{InMemoryRateLimitStore, RateLimitStore, WindowSample};

#[cfg(feature = "redis")]
pub use self::redis::RedisRateLimitStore;

/// Outcome of one limiter check. Exceeding the limit is a decision, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Calls counted in the current window, this one included.
    pub count: u64,
    pub remaining: u64,
    /// When the window frees up again.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub fn from_count(count: u64, limit: u64, reset_at_ms: i64) -> Self {
        Self {
            allowed: count <= limit,
            count,
            remaining: limit.saturating_sub(count),
            reset_at: DateTime::from_timestamp_millis(reset_at_ms).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// How long a denied caller should wait. `None` when allowed.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.allowed {
            return None;
        }
        Some((self.reset_at - now).to_std().unwrap_or_default())
    }
}

/// Namespaced key a limit is counted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Per-user limit on one action (e.g. manual prompt runs).
    pub fn user(user_id: UserId, scope: &str) -> Self {
        Self(format!("ratelimit:user:{user_id}:{scope}"))
    }

    /// Per-vendor limit shared by every caller of one model.
    pub fn vendor(provider: &str, model: &str) -> Self {
        Self(format!("ratelimit:vendor:{provider}:{model}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `limit` calls per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub limit: u64,
    pub window_seconds: u64,
}

impl Quota {
    /// Manual runs per user.
    pub const DEFAULT_USER: Quota = Quota::new(5, 60);

    /// Calls per vendor model.
    pub const DEFAULT_VENDOR: Quota = Quota::new(60, 60);

    pub const fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }
}

/// Parses `limit/window_seconds`, e.g. `5/60`.
impl FromStr for Quota {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (limit, window) = s
            .split_once('/')
            .ok_or_else(|| ValidationError::invalid(format!("quota '{s}' is not limit/window_seconds")))?;
        let limit = limit
            .trim()
            .parse()
            .map_err(|e| ValidationError::invalid(format!("quota limit '{limit}': {e}")))?;
        let window_seconds: u64 = window
            .trim()
            .parse()
            .map_err(|e| ValidationError::invalid(format!("quota window '{window}': {e}")))?;
        if window_seconds == 0 {
            return Err(ValidationError::invalid("quota window must be at least one second"));
        }
        Ok(Self::new(limit, window_seconds))
    }
}

/// A rate-limiting algorithm.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one call against `key` and decide whether it may proceed.
    ///
    /// A zero `window_seconds` is treated as one second.
    async fn check(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, StoreError>;

    async fn check_quota(&self, key: &RateLimitKey, quota: Quota) -> Result<RateLimitDecision, StoreError> {
        self.check(key, quota.limit, quota.window_seconds).await
    }
}

fn to_millis(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decision_accounting() {
        let allowed = RateLimitDecision::from_count(5, 5, 60_000);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 0);

        let denied = RateLimitDecision::from_count(7, 5, 60_000);
        assert!(!denied.allowed);
        assert_eq!(denied.count, 7);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, Utc.timestamp_opt(60, 0).unwrap());
    }

    #[test]
    fn retry_after_counts_down_to_reset() {
        let denied = RateLimitDecision::from_count(6, 5, 60_000);
        let now = Utc.timestamp_opt(45, 0).unwrap();
        assert_eq!(denied.retry_after(now), Some(Duration::from_secs(15)));
        assert_eq!(denied.retry_after(Utc.timestamp_opt(90, 0).unwrap()), Some(Duration::ZERO));

        let allowed = RateLimitDecision::from_count(1, 5, 60_000);
        assert_eq!(allowed.retry_after(now), None);
    }

    #[test]
    fn keys_are_namespaced() {
        let user = UserId::new();
        assert_eq!(
            RateLimitKey::user(user, "manual_run").as_str(),
            format!("ratelimit:user:{user}:manual_run")
        );
        assert_eq!(
            RateLimitKey::vendor("openai", "gpt-4o").to_string(),
            "ratelimit:vendor:openai:gpt-4o"
        );
    }

    #[test]
    fn parses_quotas() {
        assert_eq!("5/60".parse::<Quota>().unwrap(), Quota::DEFAULT_USER);
        assert_eq!(" 60 / 60 ".parse::<Quota>().unwrap(), Quota::DEFAULT_VENDOR);
        assert!("60".parse::<Quota>().is_err());
        assert!("5/0".parse::<Quota>().is_err());
        assert!("five/60".parse::<Quota>().is_err());
    }
}
