//! Per-key quotas fetched asynchronously and cached.
//!
//! The request path never waits for a quota lookup. A key's first request is
//! served with the failsafe limits while the lookup runs in the background;
//! afterwards the cached quota is used and refreshed once it goes stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::bucket::Limits;
use super::policy::LimitPolicy;
use crate::error::{Result, TurnstileError};

/// Trait for quota lookups.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    /// Look up the quota for a rate limit key.
    ///
    /// `Ok(None)` means the key has no dedicated quota and gets the defaults.
    async fn fetch(&self, key: &str) -> Result<Option<Limits>>;
}

#[derive(Debug)]
struct QuotaEntry {
    limits: Limits,
    last_fetch_start: Option<Instant>,
    /// Identifies the fetch currently in flight, if any
    pending_fetch: Option<u64>,
}

impl QuotaEntry {
    fn is_stale(&self, now: Instant, refresh_period: Duration) -> bool {
        match self.last_fetch_start {
            Some(started) => now >= started + refresh_period,
            None => true,
        }
    }
}

struct Inner {
    source: Arc<dyn QuotaSource>,
    entries: DashMap<String, Mutex<QuotaEntry>>,
    default_limits: Limits,
    failsafe: Limits,
    refresh_period: Duration,
    next_fetch_id: AtomicU64,
    fetch_errors: AtomicU64,
}

impl Inner {
    fn complete_fetch(&self, key: &str, fetch_id: u64, result: Result<Option<Limits>>) {
        let Some(entry) = self.entries.get(key) else {
            debug!(key = %key, "Dropping quota for forgotten key");
            return;
        };
        let mut entry = entry.lock();
        if entry.pending_fetch != Some(fetch_id) {
            return;
        }
        entry.pending_fetch = None;

        let fetched = result.and_then(|quota| {
            let limits = quota.unwrap_or(self.default_limits);
            limits.validate().map(|_| limits)
        });
        match fetched {
            Ok(limits) => {
                debug!(
                    key = %key,
                    capacity = limits.capacity,
                    refill_rate = limits.refill_rate_per_second,
                    "Quota updated"
                );
                entry.limits = limits;
            }
            Err(e) => {
                self.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Quota fetch failed, keeping previous limits");
            }
        }
    }
}

/// A [`LimitPolicy`] serving cached per-key quotas from a [`QuotaSource`].
///
/// At most one fetch per key is in flight. Fetches run on the Tokio runtime
/// the cache was created on, so `limits_for` may be called from any thread.
#[derive(Clone)]
pub struct QuotaCache {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl QuotaCache {
    /// Create a quota cache on the current Tokio runtime.
    ///
    /// `default_limits` apply to keys the source has no quota for; `failsafe`
    /// applies until a key's first fetch completes.
    pub fn new(
        source: Arc<dyn QuotaSource>,
        default_limits: Limits,
        failsafe: Limits,
        refresh_period: Duration,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            TurnstileError::Config(format!("quota cache requires a Tokio runtime: {}", e))
        })?;
        Self::with_runtime(source, default_limits, failsafe, refresh_period, runtime)
    }

    /// Create a quota cache that runs fetches on `runtime`.
    pub fn with_runtime(
        source: Arc<dyn QuotaSource>,
        default_limits: Limits,
        failsafe: Limits,
        refresh_period: Duration,
        runtime: Handle,
    ) -> Result<Self> {
        default_limits.validate()?;
        failsafe.validate()?;
        if refresh_period.is_zero() {
            return Err(TurnstileError::Config(
                "quota refresh period must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                entries: DashMap::new(),
                default_limits,
                failsafe,
                refresh_period,
                next_fetch_id: AtomicU64::new(0),
                fetch_errors: AtomicU64::new(0),
            }),
            runtime,
        })
    }

    /// Claim the fetch for `key` if its quota is stale and nobody else is fetching.
    fn claim_fetch(entry: &mut QuotaEntry, now: Instant, inner: &Inner) -> Option<u64> {
        if entry.pending_fetch.is_some() || !entry.is_stale(now, inner.refresh_period) {
            return None;
        }
        let fetch_id = inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        entry.last_fetch_start = Some(now);
        entry.pending_fetch = Some(fetch_id);
        Some(fetch_id)
    }

    fn spawn_fetch(&self, key: &str, fetch_id: u64) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        debug!(key = %key, "Starting quota fetch");
        self.runtime.spawn(async move {
            let result = inner.source.fetch(&key).await;
            inner.complete_fetch(&key, fetch_id, result);
        });
    }

    /// Number of keys with a cached quota.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Number of failed quota fetches so far.
    pub fn fetch_errors(&self) -> u64 {
        self.inner.fetch_errors.load(Ordering::Relaxed)
    }
}

impl LimitPolicy for QuotaCache {
    fn limits_for(&self, key: &str, now: Instant) -> Limits {
        let claimed = |entry: &Mutex<QuotaEntry>| {
            let mut entry = entry.lock();
            (entry.limits, Self::claim_fetch(&mut entry, now, &self.inner))
        };

        let (limits, fetch_id) = match self.inner.entries.get(key) {
            Some(entry) => claimed(entry.value()),
            None => {
                let entry = self.inner.entries.entry(key.to_string()).or_insert_with(|| {
                    Mutex::new(QuotaEntry {
                        limits: self.inner.failsafe,
                        last_fetch_start: None,
                        pending_fetch: None,
                    })
                });
                claimed(entry.value())
            }
        };

        if let Some(fetch_id) = fetch_id {
            self.spawn_fetch(key, fetch_id);
        }
        limits
    }

    fn forget(&self, key: &str) {
        self.inner.entries.remove(key);
    }
}
