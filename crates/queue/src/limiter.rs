//! Global dispatch rate limiter.
//!
//! A token bucket caps dispatched jobs at `max` per `interval` across the
//! whole worker pool, tuned to the upstream carrier's throughput limit.
//! Per-recipient limiting is not handled here — that is the compliance
//! gate's rate-limit check.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter. The bucket starts full and refills
/// continuously at `max / interval`.
pub struct TokenBucket {
    max: f64,
    interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket allowing `max` acquisitions per `interval`.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero or `interval` is zero.
    #[must_use]
    pub fn new(max: u32, interval: Duration) -> Self {
        assert!(max > 0, "rate limit must allow at least one dispatch");
        assert!(!interval.is_zero(), "rate interval must be non-zero");
        Self {
            max: f64::from(max),
            interval,
            state: Mutex::new(BucketState {
                tokens: f64::from(max),
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill);
        let gained = elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.max;
        state.tokens = (state.tokens + gained).min(self.max);
        state.last_refill = now;
    }

    /// Take a token if one is available.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, waiting for the bucket to refill if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until one full token accrues.
                let deficit = 1.0 - state.tokens;
                self.interval.mul_f64(deficit / self.max)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_starts_full() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await, "capacity must be enforced");
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);

        // Half the interval refills one of two tokens.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, Duration::from_secs(1));
        bucket.acquire().await;
        // Second acquire must sleep roughly one interval; under a paused
        // clock the sleep auto-advances.
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }
}
