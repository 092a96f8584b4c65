//! Sliding-window log.
//!
//! Every call is recorded with its timestamp; the limit applies to the calls
//! in the interval ending now. Rejected calls are recorded too, so a caller
//! hammering a closed window keeps it closed.

use async_trait::async_trait;
use tracing::debug;

use cadence_core::StoreError;

use super::store::RateLimitStore;
use super::{RateLimitDecision, RateLimitKey, RateLimiter, to_millis};

#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter<S> {
    store: S,
}

impl<S: RateLimitStore> SlidingWindowLimiter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RateLimitStore> RateLimiter for SlidingWindowLimiter<S> {
    async fn check(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_ms = to_millis(window_seconds.max(1));
        let sample = self.store.record_in_window(key.as_str(), window_ms).await?;

        let reset_at_ms = sample
            .oldest_ms
            .unwrap_or(sample.now_ms)
            .saturating_add(window_ms);

        let decision = RateLimitDecision::from_count(sample.count, limit, reset_at_ms);
        if !decision.allowed {
            debug!(key = %key, count = sample.count, limit, window_seconds, "sliding window limit exceeded");
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::InMemoryRateLimitStore;
    use crate::rate_limit::Quota;
    use cadence_core::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter() -> (SlidingWindowLimiter<Arc<InMemoryRateLimitStore<ManualClock>>>, ManualClock) {
        let clock = ManualClock::at_epoch();
        let store = Arc::new(InMemoryRateLimitStore::with_clock(clock.clone()));
        (SlidingWindowLimiter::new(store), clock)
    }

    #[tokio::test]
    async fn window_slides_past_old_calls() {
        let (limiter, clock) = limiter();
        let key = RateLimitKey::new("user:1:manual_run");

        for n in 1..=5 {
            let d = limiter.check(&key, 5, 60).await.unwrap();
            assert!(d.allowed, "call {n} at t=0 should be allowed");
        }

        clock.advance(Duration::from_secs(30));
        let denied = limiter.check(&key, 5, 60).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 6);
        assert_eq!(denied.reset_at, Utc.timestamp_opt(60, 0).unwrap());
        assert_eq!(
            denied.retry_after(Utc.timestamp_opt(30, 0).unwrap()),
            Some(Duration::from_secs(30))
        );

        // The five t=0 calls have left the window; the rejected t=30 call has not.
        clock.advance(Duration::from_secs(31));
        let d = limiter.check(&key, 5, 60).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.count, 2);
        assert_eq!(d.remaining, 3);
        assert_eq!(d.reset_at, Utc.timestamp_opt(90, 0).unwrap());
    }

    #[tokio::test]
    async fn calls_spread_across_the_boundary_still_count() {
        let (limiter, clock) = limiter();
        let key = RateLimitKey::new("vendor:anthropic:claude");
        let quota = Quota::new(3, 10);

        // Fixed buckets would reset at t=10; the sliding window does not.
        clock.set(Utc.timestamp_opt(8, 0).unwrap());
        limiter.check_quota(&key, quota).await.unwrap();
        limiter.check_quota(&key, quota).await.unwrap();
        clock.set(Utc.timestamp_opt(11, 0).unwrap());
        assert!(limiter.check_quota(&key, quota).await.unwrap().allowed);
        assert!(!limiter.check_quota(&key, quota).await.unwrap().allowed);
    }
}
