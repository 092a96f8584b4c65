//! Fixed-window counter.
//!
//! Time is cut into `window_seconds` buckets; each bucket has its own counter
//! key, so a new bucket starts from zero.

use async_trait::async_trait;
use tracing::debug;

use cadence_core::StoreError;

use super::store::RateLimitStore;
use super::{RateLimitDecision, RateLimitKey, RateLimiter, to_millis};

#[derive(Debug, Clone)]
pub struct FixedWindowLimiter<S> {
    store: S,
}

impl<S: RateLimitStore> FixedWindowLimiter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RateLimitStore> RateLimiter for FixedWindowLimiter<S> {
    async fn check(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_seconds = window_seconds.max(1);
        let window_ms = to_millis(window_seconds);

        let now_ms = self.store.now_millis().await?;
        let bucket = now_ms.div_euclid(window_ms);
        let bucket_key = format!("{key}:{bucket}");

        // Denied calls still count; the counter is never capped at the limit.
        let count = self.store.incr_with_expiry(&bucket_key, window_seconds).await?;
        let reset_at_ms = bucket.saturating_add(1).saturating_mul(window_ms);

        let decision = RateLimitDecision::from_count(count, limit, reset_at_ms);
        if !decision.allowed {
            debug!(key = %key, count, limit, window_seconds, "fixed window limit exceeded");
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::InMemoryRateLimitStore;
    use cadence_core::ManualClock;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter() -> (FixedWindowLimiter<Arc<InMemoryRateLimitStore<ManualClock>>>, ManualClock) {
        let clock = ManualClock::at_epoch();
        let store = Arc::new(InMemoryRateLimitStore::with_clock(clock.clone()));
        (FixedWindowLimiter::new(store), clock)
    }

    #[tokio::test]
    async fn sixth_call_in_window_is_denied() {
        let (limiter, clock) = limiter();
        let key = RateLimitKey::new("user:1:manual_run");

        for n in 1..=5 {
            let d = limiter.check(&key, 5, 60).await.unwrap();
            assert!(d.allowed, "call {n} should be allowed");
            assert_eq!(d.count, n);
            assert_eq!(d.remaining, 5 - n);
            clock.advance(Duration::from_secs(1));
        }

        let denied = limiter.check(&key, 5, 60).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 6);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, Utc.timestamp_opt(60, 0).unwrap());
    }

    #[tokio::test]
    async fn next_window_starts_fresh() {
        let (limiter, clock) = limiter();
        let key = RateLimitKey::new("vendor:openai");

        for _ in 0..7 {
            limiter.check(&key, 5, 60).await.unwrap();
        }

        clock.advance(Duration::from_secs(60));
        let d = limiter.check(&key, 5, 60).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.count, 1);
        assert_eq!(d.reset_at, Utc.timestamp_opt(120, 0).unwrap());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _) = limiter();
        let a = RateLimitKey::new("a");
        let b = RateLimitKey::new("b");

        for _ in 0..3 {
            limiter.check(&a, 2, 60).await.unwrap();
        }
        assert!(!limiter.check(&a, 2, 60).await.unwrap().allowed);
        assert!(limiter.check(&b, 2, 60).await.unwrap().allowed);
    }

    proptest! {
        #[test]
        fn allowed_calls_never_exceed_limit(limit in 0u64..20, calls in 0u64..50) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (limiter, _) = limiter();
            let key = RateLimitKey::new("prop");

            let decisions: Vec<_> = rt.block_on(async {
                let mut out = Vec::new();
                for _ in 0..calls {
                    out.push(limiter.check(&key, limit, 60).await.unwrap());
                }
                out
            });

            let allowed = decisions.iter().filter(|d| d.allowed).count() as u64;
            prop_assert_eq!(allowed, calls.min(limit));
            for (i, d) in decisions.iter().enumerate() {
                prop_assert_eq!(d.count, i as u64 + 1);
            }
        }
    }
}
