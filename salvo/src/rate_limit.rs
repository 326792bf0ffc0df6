//! Token-bucket cap on the provider request rate.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Limits calls to `requests_per_second` on average, allowing bursts of up to
/// `burst` calls after an idle period.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter from configuration. `None` means unlimited, which is
    /// also what a non-positive or non-finite rate gets.
    pub fn new(config: Option<&RateLimitConfig>) -> Option<Self> {
        let config = config?;
        if !(config.requests_per_second.is_finite() && config.requests_per_second > 0.0) {
            tracing::warn!(
                requests_per_second = config.requests_per_second,
                "Ignoring rate limit without a positive rate"
            );
            return None;
        }
        let burst = f64::from(config.burst.max(1));
        Some(Self {
            rate: config.requests_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tracing::trace!(wait = ?wait, "Rate limited, waiting for a token");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests_per_second: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(Some(&RateLimitConfig {
            requests_per_second,
            burst,
        }))
        .unwrap()
    }

    #[test]
    fn test_unlimited_when_unconfigured() {
        assert!(RateLimiter::new(None).is_none());
    }

    #[test]
    fn test_unusable_rates_mean_unlimited() {
        for requests_per_second in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = RateLimitConfig {
                requests_per_second,
                burst: 1,
            };
            assert!(RateLimiter::new(Some(&config)).is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = limiter(2.0, 2);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let limiter = limiter(1.0, 1);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
