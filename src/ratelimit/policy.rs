//! Policies deciding which limits apply to a key.

use std::time::Instant;

use super::bucket::Limits;

/// Supplies the limits for a rate limit key.
///
/// This trait abstracts over a single limiter-wide budget and per-account
/// quotas so the limiter can work with either. Implementations are called on
/// the request path and must not block.
pub trait LimitPolicy: Send + Sync {
    /// Limits that apply to `key` at `now`.
    fn limits_for(&self, key: &str, now: Instant) -> Limits;

    /// Drop any state kept for `key`; called when its bucket is evicted.
    fn forget(&self, _key: &str) {}
}

/// The same limits for every key.
#[derive(Debug, Clone, Copy)]
pub struct StaticLimits {
    limits: Limits,
}

impl StaticLimits {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl LimitPolicy for StaticLimits {
    fn limits_for(&self, _key: &str, _now: Instant) -> Limits {
        self.limits
    }
}
