//! Retry delays for keys that failed to reconcile.
//!
//! The delay for a key is the larger of two limits:
//!
//! - a per-key exponential backoff (`base * 2^failures`, capped at `max`) that is reset with
//!   [`RateLimiter::forget`]
//! - an overall token bucket shared by all keys, so a burst of failures cannot flood the queue

use std::{
    collections::HashMap,
    time::Duration,
};
use tokio::time::Instant;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
const DEFAULT_QPS: f64 = 10.0;
const DEFAULT_BURST: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Sustained retries per second across all keys
    pub qps: f64,
    pub burst: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

#[derive(Debug)]
pub struct ItemExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    failures: HashMap<String, u32>,
}

impl ItemExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: HashMap::new(),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying it.
    pub fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        match 2u32.checked_pow(exp).and_then(|factor| self.base_delay.checked_mul(factor)) {
            Some(delay) if delay < self.max_delay => delay,
            _ => self.max_delay,
        }
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// Takes a token, returning how long the caller has to wait until the token is actually available.
    pub fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    per_item: ItemExponentialBackoff,
    bucket: TokenBucket,
}

impl RateLimiter {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            per_item: ItemExponentialBackoff::new(config.base_delay, config.max_delay),
            bucket: TokenBucket::new(config.qps, config.burst),
        }
    }

    pub fn when(&mut self, key: &str) -> Duration {
        let item = self.per_item.when(key);
        let overall = self.bucket.reserve();
        item.max(overall)
    }

    pub fn forget(&mut self, key: &str) {
        self.per_item.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.per_item.num_requeues(key)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_backoff_doubles_until_cap() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));

        let delays: Vec<_> = (0..10).map(|_| backoff.when("web/cafe")).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert_eq!(delays[9], Duration::from_secs(1));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(backoff.num_requeues("web/cafe"), 10);
    }

    #[test]
    fn item_backoff_is_tracked_per_key_and_reset_by_forget() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        backoff.when("web/cafe");
        backoff.when("web/cafe");

        assert_eq!(backoff.when("web/tea"), Duration::from_millis(5));

        backoff.forget("web/cafe");
        assert_eq!(backoff.num_requeues("web/cafe"), 0);
        assert_eq!(backoff.when("web/cafe"), Duration::from_millis(5));
    }

    #[test]
    fn item_backoff_survives_huge_failure_counts() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        for _ in 0..2000 {
            backoff.when("web/cafe");
        }
        assert_eq!(backoff.when("web/cafe"), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let mut bucket = TokenBucket::new(10.0, 2);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);

        let third = bucket.reserve();
        assert!(third > Duration::from_millis(90) && third <= Duration::from_millis(100), "{third:?}");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_uses_larger_delay() {
        let mut limiter = RateLimiter::new(&BackoffConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(10),
            qps: 1.0,
            burst: 1,
        });

        assert_eq!(limiter.when("web/cafe"), Duration::from_millis(5));
        // bucket is empty now, a second failure waits for the next token
        let delay = limiter.when("web/tea");
        assert!(delay > Duration::from_millis(900), "{delay:?}");
    }
}
