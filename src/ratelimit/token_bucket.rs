//! In-memory keyed token buckets with background refill.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::ratelimit::RateLimiter;

/// Token-bucket limiter over opaque string keys.
///
/// Buckets are created lazily at full capacity. A single background task
/// tops up every known bucket each `refill_interval`; `allow` calls on
/// distinct keys do not serialise.
pub struct TokenBucketLimiter {
    capacity: f64,
    buckets: Arc<DashMap<String, Mutex<f64>>>,
    stop_tx: watch::Sender<bool>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: f64, refill_rate: f64, refill_interval: Duration) -> Self {
        let buckets: Arc<DashMap<String, Mutex<f64>>> = Arc::new(DashMap::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let refill_tokens = refill_rate * refill_interval.as_secs_f64();
        tokio::spawn(refill_loop(
            buckets.clone(),
            capacity,
            refill_tokens,
            refill_interval,
            stop_rx,
        ));

        Self {
            capacity,
            buckets,
            stop_tx,
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> bool {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(self.capacity));

        let mut tokens = bucket.lock().expect("bucket lock poisoned");
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Adds `refill_tokens` to every bucket each tick, clamped to capacity.
///
/// Buckets inserted while an iteration is underway are picked up on this
/// tick or the next one.
async fn refill_loop(
    buckets: Arc<DashMap<String, Mutex<f64>>>,
    capacity: f64,
    refill_tokens: f64,
    refill_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(refill_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for entry in buckets.iter() {
                    let mut tokens = entry.value().lock().expect("bucket lock poisoned");
                    *tokens = (*tokens + refill_tokens).min(capacity);
                }
            }
            _ = stop_rx.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumes_down_to_zero() {
        let limiter = TokenBucketLimiter::new(2.0, 1.0, Duration::from_secs(60));
        assert!(limiter.allow("10.0.0.1:4000"));
        assert!(limiter.allow("10.0.0.1:4000"));
        assert!(!limiter.allow("10.0.0.1:4000"));
        limiter.stop();
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let limiter = TokenBucketLimiter::new(1.0, 1.0, Duration::from_secs(60));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        limiter.stop();
    }

    #[tokio::test]
    async fn refill_restores_tokens() {
        let limiter = TokenBucketLimiter::new(2.0, 20.0, Duration::from_millis(50));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn refill_clamps_at_capacity() {
        let limiter = TokenBucketLimiter::new(2.0, 100.0, Duration::from_millis(100));
        assert!(limiter.allow("k"));

        // Several generous refill ticks later the bucket holds exactly
        // capacity, not more.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        limiter.stop();
    }

    #[tokio::test]
    async fn no_refill_after_stop() {
        // Stop lands long before the first tick would.
        let limiter = TokenBucketLimiter::new(1.0, 100.0, Duration::from_millis(200));
        assert!(limiter.allow("k"));
        limiter.stop();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!limiter.allow("k"));
    }
}
