//! Token bucket for the inbound event rate ceiling.

use std::time::{Duration, Instant};

/// Classic token bucket: `capacity` tokens, one token refilled every
/// `interval`. Callers that find the bucket empty drop their event; nothing
/// ever queues here.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, interval: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            interval,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        if elapsed >= self.interval && self.interval.as_secs_f64() > 0.0 {
            let new_tokens = elapsed.as_secs_f64() / self.interval.as_secs_f64();
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Deterministic variant for tests.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token count (after refill).
    pub fn remaining(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_to_empty() {
        let mut bucket = TokenBucket::new(2, Duration::from_secs(10));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, Duration::from_millis(100));
        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start));
        // One interval later a token is back.
        assert!(bucket.try_acquire_at(start + Duration::from_millis(150)));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3, Duration::from_millis(10));
        // Long idle: still only `capacity` tokens.
        let later = start + Duration::from_secs(60);
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut bucket = TokenBucket::new(0, Duration::from_secs(1));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
