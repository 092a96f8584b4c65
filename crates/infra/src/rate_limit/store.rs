//! Atomic primitives the limiters are built on, plus the in-memory backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use cadence_core::{Clock, StoreError, SystemClock};

/// Result of recording one call in a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    /// Calls left in the window after trimming, this one included.
    pub count: u64,
    /// Store time the call was recorded at.
    pub now_ms: i64,
    /// Timestamp of the oldest call still in the window.
    pub oldest_ms: Option<i64>,
}

/// Shared store offering the atomic operations both limiters need.
///
/// Every method is one atomic step on the store; time is the store's clock, so
/// processes with skewed clocks still agree on window boundaries.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Current store time in milliseconds since the epoch.
    async fn now_millis(&self) -> Result<i64, StoreError>;

    /// Increment `key` and (re)set its expiry in one step. Returns the new count.
    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError>;

    /// Add a call at the store's current time, drop calls older than
    /// `window_ms`, refresh the expiry and report what is left.
    async fn record_in_window(&self, key: &str, window_ms: i64) -> Result<WindowSample, StoreError>;
}

#[async_trait]
impl<T: RateLimitStore + ?Sized> RateLimitStore for Arc<T> {
    async fn now_millis(&self) -> Result<i64, StoreError> {
        (**self).now_millis().await
    }

    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        (**self).incr_with_expiry(key, ttl_seconds).await
    }

    async fn record_in_window(&self, key: &str, window_ms: i64) -> Result<WindowSample, StoreError> {
        (**self).record_in_window(key, window_ms).await
    }
}

#[derive(Debug)]
struct Counter {
    count: u64,
    expires_at_ms: i64,
}

#[derive(Debug)]
struct Window {
    calls: Vec<i64>,
    expires_at_ms: i64,
}

/// Writes between sweeps of expired keys.
const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Default)]
struct LimitState {
    counters: HashMap<String, Counter>,
    windows: HashMap<String, Window>,
    writes: u64,
}

impl LimitState {
    fn sweep(&mut self, now: i64) {
        self.counters.retain(|_, c| c.expires_at_ms > now);
        self.windows.retain(|_, w| w.expires_at_ms > now);
    }

    /// Count a write, dropping expired keys every `SWEEP_EVERY` writes.
    fn note_write(&mut self, now: i64) {
        self.writes = self.writes.wrapping_add(1);
        if self.writes % SWEEP_EVERY == 0 {
            self.sweep(now);
        }
    }
}

/// Process-local store with key expiry driven by an injectable clock.
///
/// Only enforces limits within one process.
#[derive(Debug)]
pub struct InMemoryRateLimitStore<C: Clock = SystemClock> {
    state: Mutex<LimitState>,
    clock: C,
}

impl InMemoryRateLimitStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for InMemoryRateLimitStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryRateLimitStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            state: Mutex::new(LimitState::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LimitState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::poisoned("rate limit store"))
    }

    /// Number of live keys; expired keys are dropped first.
    pub fn key_count(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        state.sweep(now);
        Ok(state.counters.len() + state.windows.len())
    }
}

#[async_trait]
impl<C: Clock> RateLimitStore for InMemoryRateLimitStore<C> {
    async fn now_millis(&self) -> Result<i64, StoreError> {
        Ok(self.clock.now_millis())
    }

    async fn incr_with_expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let expires_at_ms = now.saturating_add(super::to_millis(ttl_seconds));
        let mut state = self.lock()?;
        state.note_write(now);

        let counter = state.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at_ms,
        });
        if counter.expires_at_ms <= now {
            counter.count = 0;
        }
        counter.count += 1;
        counter.expires_at_ms = expires_at_ms;
        Ok(counter.count)
    }

    async fn record_in_window(&self, key: &str, window_ms: i64) -> Result<WindowSample, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        state.note_write(now);

        let window = state.windows.entry(key.to_string()).or_insert(Window {
            calls: Vec::new(),
            expires_at_ms: now,
        });
        if window.expires_at_ms <= now {
            window.calls.clear();
        }

        window.calls.push(now);
        let cutoff = now.saturating_sub(window_ms);
        window.calls.retain(|&at| at >= cutoff);
        window.expires_at_ms = now.saturating_add(window_ms);

        Ok(WindowSample {
            count: window.calls.len() as u64,
            now_ms: now,
            oldest_ms: window.calls.iter().min().copied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn counters_expire() {
        let clock = ManualClock::at_epoch();
        let store = InMemoryRateLimitStore::with_clock(clock.clone());

        assert_eq!(store.incr_with_expiry("k", 10).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("k", 10).await.unwrap(), 2);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.key_count().unwrap(), 0);
        assert_eq!(store.incr_with_expiry("k", 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn window_trims_old_calls() {
        let clock = ManualClock::at_epoch();
        let store = InMemoryRateLimitStore::with_clock(clock.clone());

        store.record_in_window("w", 1_000).await.unwrap();
        clock.advance(Duration::from_millis(600));
        let sample = store.record_in_window("w", 1_000).await.unwrap();
        assert_eq!(sample.count, 2);
        assert_eq!(sample.oldest_ms, Some(0));

        clock.advance(Duration::from_millis(600));
        let sample = store.record_in_window("w", 1_000).await.unwrap();
        assert_eq!(sample.count, 2);
        assert_eq!(sample.now_ms, 1_200);
        assert_eq!(sample.oldest_ms, Some(600));
    }

    #[tokio::test]
    async fn expired_keys_are_swept_on_write() {
        let clock = ManualClock::at_epoch();
        let store = InMemoryRateLimitStore::with_clock(clock.clone());

        // One fresh bucket per second, as a fixed window of 1s produces.
        for bucket in 0..1_000 {
            store.incr_with_expiry(&format!("k:{bucket}"), 1).await.unwrap();
            store.record_in_window(&format!("w:{bucket}"), 1_000).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let state = store.state.lock().unwrap();
        let stored = state.counters.len() + state.windows.len();
        assert!(stored <= SWEEP_EVERY as usize, "{stored} keys kept");
    }
}
