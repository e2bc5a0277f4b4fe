//! Token bucket state for a single rate limit key.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Result, TurnstileError};

/// Capacity and refill rate of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    /// Maximum number of tokens the bucket holds (the burst size)
    pub capacity: u64,
    /// Tokens added back per second
    pub refill_rate_per_second: f64,
}

impl Limits {
    /// Create a new set of limits.
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
        }
    }

    /// Reject limits that cannot describe a working bucket.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TurnstileError::Config(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "refill_rate_per_second must be a positive number, got {}",
                self.refill_rate_per_second
            )));
        }
        Ok(())
    }

    /// Time for an empty bucket to fill up completely.
    ///
    /// Saturates at `Duration::MAX` for rates too slow to express.
    pub fn full_refill_time(&self) -> Duration {
        let secs = self.capacity as f64 / self.refill_rate_per_second;
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request may proceed; its cost has been deducted.
    Admit,
    /// The request is denied.
    Reject,
    /// The request is denied now but would be admitted after this delay.
    Delay(Duration),
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// A token bucket tracking the budget of one key.
///
/// Not synchronized on its own; the limiter wraps each bucket in a mutex.
#[derive(Debug)]
pub struct Bucket {
    limits: Limits,
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    /// Create a full bucket.
    pub fn new(limits: Limits, now: Instant) -> Self {
        Self {
            limits,
            tokens: limits.capacity as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Switch to new limits, keeping the current token balance within the new capacity.
    pub fn apply_limits(&mut self, limits: Limits) {
        if self.limits == limits {
            return;
        }
        self.limits = limits;
        self.tokens = self.tokens.min(limits.capacity as f64);
    }

    /// Add the tokens accrued since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = self.limits.capacity as f64;
        self.tokens = (self.tokens + elapsed * self.limits.refill_rate_per_second).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
        self.enforce_bounds();
    }

    /// Refill, then try to take `cost` tokens.
    ///
    /// With `allow_delay`, a request that could succeed later yields
    /// [`Decision::Delay`] with the time until enough tokens accrue.
    pub fn take(&mut self, cost: u64, now: Instant, allow_delay: bool) -> Decision {
        self.refill(now);
        if now > self.last_seen {
            self.last_seen = now;
        }

        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            self.enforce_bounds();
            return Decision::Admit;
        }

        if !allow_delay {
            return Decision::Reject;
        }
        match self.time_until_available(cost) {
            Some(delay) => Decision::Delay(delay),
            None => Decision::Reject,
        }
    }

    /// Time until `cost` tokens are available, or `None` if they never will be.
    fn time_until_available(&self, cost: f64) -> Option<Duration> {
        let rate = self.limits.refill_rate_per_second;
        if cost > self.limits.capacity as f64 || rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((cost - self.tokens) / rate).ok()
    }

    fn enforce_bounds(&mut self) {
        let capacity = self.limits.capacity as f64;
        if self.tokens.is_nan() || self.tokens < 0.0 {
            error!(
                tokens = self.tokens,
                capacity = self.limits.capacity,
                "Token balance fell below zero, clamping"
            );
            self.tokens = 0.0;
        } else if self.tokens > capacity {
            self.tokens = capacity;
        }
    }

    /// Whether the bucket has gone unused for longer than `ttl`.
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }

    /// Current token balance, as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Limits currently applied to this bucket.
    pub fn limits(&self) -> Limits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(capacity: u64, rate: f64) -> Limits {
        Limits::new(capacity, rate)
    }

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = Bucket::new(limits(10, 1.0), Instant::now());
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[test]
    fn test_take_within_capacity() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(5, 1.0), now);

        for _ in 0..5 {
            assert_eq!(bucket.take(1, now, false), Decision::Admit);
        }

        // The 6th request should be rejected
        assert_eq!(bucket.take(1, now, false), Decision::Reject);
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(5, 2.0), now);
        bucket.take(5, now, false);

        bucket.refill(now + Duration::from_secs(60));
        assert_eq!(bucket.tokens(), 5.0);
    }

    #[test]
    fn test_partial_refill() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(10, 4.0), now);
        bucket.take(10, now, false);

        bucket.refill(now + Duration::from_millis(500));
        assert!((bucket.tokens() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_delay_reports_time_until_tokens() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(4, 2.0), now);
        bucket.take(4, now, false);

        match bucket.take(3, now, true) {
            Decision::Delay(delay) => assert_eq!(delay, Duration::from_millis(1500)),
            other => panic!("expected delay, got {:?}", other),
        }
        // A delayed request does not consume anything
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_cost_above_capacity_is_rejected_even_with_delay() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(3, 1.0), now);
        assert_eq!(bucket.take(4, now, true), Decision::Reject);
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let now = Instant::now() + Duration::from_secs(10);
        let mut bucket = Bucket::new(limits(2, 1.0), now);
        bucket.take(2, now, false);

        bucket.refill(now - Duration::from_secs(5));
        assert_eq!(bucket.tokens(), 0.0);
        assert_eq!(bucket.take(1, now, false), Decision::Reject);
    }

    #[test]
    fn test_apply_limits_clamps_tokens() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(10, 1.0), now);

        bucket.apply_limits(limits(4, 1.0));
        assert_eq!(bucket.tokens(), 4.0);

        // Growing capacity does not mint tokens
        bucket.apply_limits(limits(20, 1.0));
        assert_eq!(bucket.tokens(), 4.0);
        assert_eq!(bucket.limits().capacity, 20);
    }

    #[test]
    fn test_corrupted_balance_is_clamped() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(5, 1.0), now);
        bucket.tokens = -3.0;
        bucket.enforce_bounds();
        assert_eq!(bucket.tokens(), 0.0);

        bucket.tokens = f64::NAN;
        bucket.enforce_bounds();
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_idle_detection() {
        let now = Instant::now();
        let bucket = Bucket::new(limits(1, 1.0), now);
        let ttl = Duration::from_secs(10);

        assert!(!bucket.is_idle(now + ttl, ttl));
        assert!(bucket.is_idle(now + ttl + Duration::from_secs(1), ttl));
    }

    #[test]
    fn test_limits_validation() {
        assert!(limits(10, 1.5).validate().is_ok());
        assert!(limits(0, 1.0).validate().is_err());
        assert!(limits(10, 0.0).validate().is_err());
        assert!(limits(10, -1.0).validate().is_err());
        assert!(limits(10, f64::INFINITY).validate().is_err());
        assert!(limits(10, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_full_refill_time() {
        assert_eq!(limits(10, 5.0).full_refill_time(), Duration::from_secs(2));
        assert_eq!(limits(10, 1e-20).full_refill_time(), Duration::MAX);
    }

    #[test]
    fn test_unrepresentable_delay_is_rejected() {
        let now = Instant::now();
        let mut bucket = Bucket::new(limits(1, 1e-20), now);

        assert_eq!(bucket.take(1, now, true), Decision::Admit);
        // Refilling one token would take longer than a Duration can hold
        assert_eq!(bucket.take(1, now, true), Decision::Reject);
        assert_eq!(bucket.take(1, now + Duration::from_secs(3600), true), Decision::Reject);
    }
}
