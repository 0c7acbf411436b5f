//! Per-IP token buckets

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use anonet_core::types::RATE_LIMIT_TOKENS;

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Bucket capacity (burst size).
    pub burst: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst: RATE_LIMIT_TOKENS,
            refill_per_sec: 1.0,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by source IP.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `ip`. Returns false when the bucket is dry.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens: self.config.burst as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle past `max_idle` (full buckets carry no state
    /// worth keeping).
    pub fn prune_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
    }

    pub fn tracked_ips(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(tag: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, tag))
    }

    #[test]
    fn test_burst_allows_exactly_burst_connections() {
        let limiter = RateLimiter::default();

        for _ in 0..RATE_LIMIT_TOKENS {
            assert!(limiter.allow(ip(1)));
        }
        assert!(!limiter.allow(ip(1)));
    }

    #[test]
    fn test_ips_are_limited_independently() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            burst: 2,
            refill_per_sec: 1.0,
        });

        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        assert!(limiter.allow(ip(2)));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            burst: 1,
            refill_per_sec: 1000.0,
        });

        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.allow(ip(1)));
    }

    #[test]
    fn test_tokens_cap_at_burst() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            burst: 3,
            refill_per_sec: 1000.0,
        });

        // Long idle must not accumulate beyond the burst
        assert!(limiter.allow(ip(1)));
        std::thread::sleep(Duration::from_millis(10));
        for _ in 0..3 {
            assert!(limiter.allow(ip(1)));
        }
        assert!(!limiter.allow(ip(1)));
    }

    #[test]
    fn test_prune_idle() {
        let limiter = RateLimiter::default();
        limiter.allow(ip(1));
        limiter.allow(ip(2));
        assert_eq!(limiter.tracked_ips(), 2);

        std::thread::sleep(Duration::from_millis(5));
        limiter.prune_idle(Duration::from_millis(1));
        assert_eq!(limiter.tracked_ips(), 0);
    }
}
