//! Token bucket bounding how many jobs start per window.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Allows `max` job starts per `window`, refilled continuously.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per second
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(max: usize, window: Duration) -> Self {
        let capacity = max.max(1) as f64;
        let window = window.as_secs_f64().max(f64::EPSILON);
        Self {
            rate: capacity / window,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_update = now;
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / self.rate
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Take a token if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> usize {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_exhausted() {
        let limiter = TokenBucket::new(3, Duration::from_secs(60));
        assert_eq!(limiter.available(), 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_refills_over_window() {
        let limiter = TokenBucket::new(2, Duration::from_millis(100));
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(!limiter.try_acquire());

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
