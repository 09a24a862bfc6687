//! Per-origin request admission.
//!
//! One token bucket per origin host, created lazily on first use and refilled
//! at `requests_per_second` up to `burst` tokens. The buckets live in
//! `governor`'s keyed state store, so unrelated hosts never contend on a
//! shared lock. [`OriginThrottle::acquire`] never fails; it only delays.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ThrottleConfig, REQUESTS_PER_SECOND_RANGE};

/// Shared per-host token buckets. Cheap to clone.
#[derive(Clone)]
pub struct OriginThrottle {
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
}

impl OriginThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        let (min_rps, max_rps) = (
            *REQUESTS_PER_SECOND_RANGE.start(),
            *REQUESTS_PER_SECOND_RANGE.end(),
        );
        // NaN falls through `max` to the floor.
        let rps = config.requests_per_second.max(min_rps).min(max_rps);
        let period = Duration::from_secs_f64(1.0 / rps);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Wait until a request to the origin serving `url` may proceed.
    pub async fn acquire(&self, url: &str) {
        let key = origin_key(url);
        self.limiter.until_key_ready(&key).await;
    }

    /// Drop buckets that have fully refilled; they are indistinguishable from fresh ones.
    pub fn evict_idle(&self) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before.saturating_sub(self.limiter.len())
    }

    pub fn tracked_origins(&self) -> usize {
        self.limiter.len()
    }
}

/// Bucket key for a URL: the lowercased host (with port when explicit).
pub fn origin_key(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host.to_ascii_lowercase(), port),
            (Some(host), None) => host.to_ascii_lowercase(),
            _ => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn throttle(rps: f64, burst: u32) -> OriginThrottle {
        OriginThrottle::new(&ThrottleConfig {
            requests_per_second: rps,
            burst,
            idle_evict_secs: 600,
        })
    }

    #[test]
    fn keys_by_host() {
        assert_eq!(origin_key("https://Blog.Example.com/a?b=1"), "blog.example.com");
        assert_eq!(origin_key("http://localhost:8080/feed"), "localhost:8080");
        assert_eq!(origin_key("not a url"), "not a url");
    }

    #[tokio::test]
    async fn same_origin_is_paced() {
        let t = throttle(10.0, 1);
        let start = Instant::now();
        for _ in 0..3 {
            t.acquire("https://slow.example.com/x").await;
        }
        // first token is immediate, the next two wait ~100ms each
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn origins_do_not_share_buckets() {
        let t = throttle(1.0, 1);
        let start = Instant::now();
        t.acquire("https://a.example.com/").await;
        t.acquire("https://b.example.com/").await;
        t.acquire("https://c.example.com/").await;
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(t.tracked_origins(), 3);
    }

    #[tokio::test]
    async fn degenerate_rates_are_clamped() {
        let slow = throttle(1e-300, 1);
        slow.acquire("https://a.example.com/").await;
        let fast = throttle(f64::INFINITY, 1);
        fast.acquire("https://a.example.com/").await;
        let nan = throttle(f64::NAN, 1);
        nan.acquire("https://a.example.com/").await;
        assert_eq!(slow.tracked_origins(), 1);
    }

    #[tokio::test]
    async fn refilled_buckets_are_evicted() {
        let t = throttle(50.0, 1);
        t.acquire("https://a.example.com/").await;
        t.acquire("https://b.example.com/").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(t.evict_idle(), 2);
        assert_eq!(t.tracked_origins(), 0);
    }
}
