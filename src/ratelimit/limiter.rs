//! Core rate limiter implementation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::bucket::{Bucket, Decision, Limits};
use super::clock::{Clock, SystemClock};
use super::policy::{LimitPolicy, StaticLimits};
use super::quota::QuotaCache;
use super::rules::QuotaFile;
use crate::config::{LimiterConfig, TurnstileConfig};
use crate::error::{Result, TurnstileError};

/// Snapshot of the limiter's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub admitted: u64,
    pub rejected: u64,
    pub delayed: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    delayed: AtomicU64,
    evicted: AtomicU64,
}

impl Counters {
    fn record(&self, decision: &Decision) {
        let counter = match decision {
            Decision::Admit => &self.admitted,
            Decision::Reject => &self.rejected,
            Decision::Delay(_) => &self.delayed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LimiterStats {
        LimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// The token bucket rate limiter.
///
/// Buckets live in a sharded map keyed by the rate limit key. Each bucket
/// sits behind its own mutex, so calls for the same key are linearized while
/// calls for different keys only contend when they share a shard.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Token buckets indexed by key
    buckets: DashMap<String, Mutex<Bucket>>,
    /// Source of per-key limits
    policy: Arc<dyn LimitPolicy>,
    /// Time source for `acquire` and the sweeper
    clock: Arc<dyn Clock>,
    /// Buckets unused for longer than this are evicted
    idle_ttl: Duration,
    counters: Counters,
}

impl RateLimiter {
    /// Create a rate limiter applying the configured limits to every key.
    pub fn new(config: &LimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create the rate limiter described by the service configuration.
    ///
    /// With a quota rules file configured, limits are looked up per key
    /// through a [`QuotaCache`]; this must then run inside a Tokio runtime.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let Some(rules_path) = &config.quotas.rules_path else {
            return Self::new(&config.limiter);
        };

        let source = Arc::new(QuotaFile::open(rules_path)?);
        let cache = QuotaCache::new(
            source,
            config.limiter.limits(),
            config.failsafe_limits(),
            config.quotas.refresh_period(),
        )?;
        info!(
            rules = %rules_path.display(),
            refresh_secs = config.quotas.refresh_period_secs,
            "Per-account quotas enabled"
        );
        Self::with_policy(&config.limiter, Arc::new(cache), Arc::new(SystemClock))
    }

    /// Create a rate limiter with uniform limits and a custom clock.
    pub fn with_clock(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let policy = Arc::new(StaticLimits::new(config.limits()));
        Self::with_policy(config, policy, clock)
    }

    /// Create a rate limiter whose per-key limits come from `policy`.
    ///
    /// The configured limits are still validated; they serve as the policy's
    /// reference point for the idle TTL check.
    pub fn with_policy(
        config: &LimiterConfig,
        policy: Arc<dyn LimitPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let idle_ttl = config.idle_ttl();
        let refill_time = config.limits().full_refill_time();
        if idle_ttl < refill_time {
            warn!(
                idle_ttl_secs = idle_ttl.as_secs_f64(),
                full_refill_secs = refill_time.as_secs_f64(),
                "Idle TTL is shorter than the full refill time; evicted keys regain their burst early"
            );
        }

        Ok(Self {
            buckets: DashMap::new(),
            policy,
            clock,
            idle_ttl,
            counters: Counters::default(),
        })
    }

    /// Try to take `cost` tokens from the bucket for `key` at `now`.
    ///
    /// Returns [`Decision::Admit`] or [`Decision::Reject`].
    pub fn try_acquire(&self, key: &str, cost: u64, now: Instant) -> Result<Decision> {
        self.check(key, cost, now, false)
    }

    /// Like [`try_acquire`](Self::try_acquire), but reports how long the
    /// caller would have to wait when the request can succeed later.
    pub fn try_acquire_or_delay(&self, key: &str, cost: u64, now: Instant) -> Result<Decision> {
        self.check(key, cost, now, true)
    }

    /// [`try_acquire`](Self::try_acquire) at the limiter clock's current time.
    pub fn acquire(&self, key: &str, cost: u64) -> Result<Decision> {
        self.try_acquire(key, cost, self.clock.now())
    }

    fn check(&self, key: &str, cost: u64, now: Instant, allow_delay: bool) -> Result<Decision> {
        if key.is_empty() {
            return Err(TurnstileError::InvalidKey);
        }
        if cost == 0 {
            return Err(TurnstileError::InvalidCost(cost));
        }

        let limits = self.policy.limits_for(key, now);

        trace!(key = %key, cost = cost, "Checking rate limit");

        let decision = match self.buckets.get(key) {
            Some(bucket) => Self::take(&bucket, limits, cost, now, allow_delay),
            None => {
                let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
                    debug!(
                        key = %key,
                        capacity = limits.capacity,
                        refill_rate = limits.refill_rate_per_second,
                        "Creating new token bucket"
                    );
                    Mutex::new(Bucket::new(limits, now))
                });
                Self::take(&bucket, limits, cost, now, allow_delay)
            }
        };

        if !decision.is_admitted() {
            debug!(key = %key, cost = cost, decision = ?decision, "Rate limit exceeded");
        }
        self.counters.record(&decision);
        Ok(decision)
    }

    fn take(
        bucket: &Mutex<Bucket>,
        limits: Limits,
        cost: u64,
        now: Instant,
        allow_delay: bool,
    ) -> Decision {
        let mut bucket = bucket.lock();
        bucket.apply_limits(limits);
        bucket.take(cost, now, allow_delay)
    }

    /// Remove buckets that have been idle for longer than the TTL.
    ///
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.idle_ttl;
        let mut evicted = 0usize;

        // retain holds each shard's write lock, so no request can recreate the
        // bucket before its policy state is gone
        self.buckets.retain(|key, bucket| {
            if bucket.get_mut().is_idle(now, ttl) {
                self.policy.forget(key);
                evicted += 1;
                false
            } else {
                true
            }
        });

        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(count = evicted, "Evicted idle buckets");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until `shutdown` resolves.
    pub fn spawn_sweeper<F>(self: &Arc<Self>, interval: Duration, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        debug!("Bucket sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle(limiter.clock.now());
                        let stats = limiter.stats();
                        info!(
                            evicted = evicted,
                            buckets = limiter.bucket_count(),
                            admitted = stats.admitted,
                            rejected = stats.rejected,
                            delayed = stats.delayed,
                            "Bucket sweep complete"
                        );
                    }
                }
            }
        })
    }

    /// Current token balance for `key`, as of its last update.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.lock().tokens())
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Cumulative decision and eviction counters.
    pub fn stats(&self) -> LimiterStats {
        self.counters.snapshot()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// The limiter's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
