//! Rate-limited handler wrapper for calls to outside vendors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use cadence_core::HandlerError;
use cadence_infra::jobs::{HandlerOutput, JobHandler, JobPayload, QueueEntry};
use cadence_infra::rate_limit::{Quota, RateLimitKey, RateLimiter};

type KeyFn = dyn Fn(&QueueEntry) -> Option<RateLimitKey> + Send + Sync;

/// Counts every execution against a shared quota before delegating.
///
/// Entries the key function returns `None` for are not counted. A denied call
/// fails with status 429 and goes through the normal retry path. When the
/// limiter's store is unreachable the call is let through.
pub struct ThrottledHandler<H> {
    inner: H,
    limiter: Arc<dyn RateLimiter>,
    quota: Quota,
    key: Box<KeyFn>,
}

impl<H: JobHandler> ThrottledHandler<H> {
    pub fn new(
        inner: H,
        limiter: Arc<dyn RateLimiter>,
        quota: Quota,
        key: impl Fn(&QueueEntry) -> Option<RateLimitKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            limiter,
            quota,
            key: Box::new(key),
        }
    }
}

#[async_trait]
impl<H: JobHandler> JobHandler for ThrottledHandler<H> {
    async fn execute(&self, entry: &QueueEntry) -> Result<HandlerOutput, HandlerError> {
        let Some(key) = (self.key)(entry) else {
            return self.inner.execute(entry).await;
        };
        match self.limiter.check_quota(&key, self.quota).await {
            Ok(decision) if !decision.allowed => {
                let wait = decision.retry_after(Utc::now()).unwrap_or_default();
                return Err(HandlerError::new(format!(
                    "rate limited on {key}; retry after {}s",
                    wait.as_secs().max(1)
                ))
                .with_http_status(429));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(entry_id = %entry.id, key = %key, error = %e, "rate limiter unavailable, proceeding");
            }
        }
        self.inner.execute(entry).await
    }
}

/// Vendor key for a webhook: one quota per target host.
pub fn webhook_host_key(entry: &QueueEntry) -> Option<RateLimitKey> {
    Some(match &entry.payload {
        JobPayload::Webhook { url, .. } => RateLimitKey::vendor("webhook", host_of(url)),
        other => RateLimitKey::vendor(other.kind_name(), "default"),
    })
}

/// User key scoped by job kind. Entries nobody initiated are not counted.
pub fn initiator_key(entry: &QueueEntry) -> Option<RateLimitKey> {
    entry
        .initiated_by
        .map(|user| RateLimitKey::user(user, entry.payload.kind_name()))
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    authority.rsplit_once('@').map_or(authority, |(_, host)| host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cadence_core::{TenantId, UserId};
    use cadence_core::clock::ManualClock;
    use cadence_infra::jobs::{FnHandler, HttpMethod, NewQueueEntry};
    use cadence_infra::rate_limit::{FixedWindowLimiter, InMemoryRateLimitStore};
    use serde_json::{Map, json};

    fn webhook(url: &str) -> QueueEntry {
        QueueEntry::from_request(
            NewQueueEntry::new(TenantId::new(), JobPayload::webhook(url, HttpMethod::Post, None)),
            Utc::now(),
        )
    }

    #[test]
    fn keys_by_target_host() {
        assert_eq!(
            webhook_host_key(&webhook("https://user:pw@api.example.com:8443/v1/hook?x=1"))
                .unwrap()
                .as_str(),
            "ratelimit:vendor:webhook:api.example.com:8443"
        );
        assert_eq!(host_of("http://example.com"), "example.com");
        assert_eq!(host_of("example.com/path"), "example.com");

        let custom = QueueEntry::from_request(
            NewQueueEntry::new(TenantId::new(), JobPayload::custom("report", Map::new())),
            Utc::now(),
        );
        assert_eq!(
            webhook_host_key(&custom).unwrap().as_str(),
            "ratelimit:vendor:report:default"
        );
    }

    #[test]
    fn keys_by_initiating_user() {
        let anonymous = webhook("https://vendor.test/a");
        assert_eq!(initiator_key(&anonymous), None);

        let user = UserId::new();
        let initiated = QueueEntry::from_request(
            NewQueueEntry::new(TenantId::new(), JobPayload::webhook("https://vendor.test/a", HttpMethod::Post, None))
                .initiated_by(user),
            Utc::now(),
        );
        assert_eq!(
            initiator_key(&initiated).unwrap().as_str(),
            format!("ratelimit:user:{user}:webhook")
        );
    }

    #[tokio::test]
    async fn unkeyed_entries_are_not_counted() {
        let store = InMemoryRateLimitStore::with_clock(ManualClock::at_epoch());
        let limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowLimiter::new(store));
        let inner = FnHandler(|_payload| async { Ok::<_, HandlerError>(HandlerOutput::new(json!("sent"))) });
        let handler = ThrottledHandler::new(inner, limiter, Quota::new(1, 60), initiator_key);

        for _ in 0..3 {
            assert!(handler.execute(&webhook("https://vendor.test/a")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn denies_past_quota_without_calling_inner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let inner = FnHandler(move |_payload| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(HandlerOutput::new(json!("sent")))
            }
        });
        let store = InMemoryRateLimitStore::with_clock(ManualClock::at_epoch());
        let limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowLimiter::new(store));
        let handler = ThrottledHandler::new(inner, limiter, Quota::new(2, 60), webhook_host_key);

        let a = webhook("https://vendor.test/a");
        assert!(handler.execute(&a).await.is_ok());
        assert!(handler.execute(&a).await.is_ok());

        let err = handler.execute(&a).await.unwrap_err();
        assert_eq!(err.http_status, Some(429));
        assert!(err.message.starts_with("rate limited on ratelimit:vendor:webhook:vendor.test"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Another host has its own budget.
        assert!(handler.execute(&webhook("https://other.test/a")).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
