//! Per-source query rate limiting.
//!
//! Each source IP gets its own token bucket (`rate` tokens per second,
//! `burst` capacity), created lazily on first query and stored in a
//! `DashMap` for lock-free reads. A cleanup task prunes the map down to
//! [`PRUNE_TARGET`] entries whenever it grows past [`MAX_TRACKED_SOURCES`],
//! dropping the longest-idle sources first.
//!
//! `update_limits` swaps the quota and resets existing buckets; every
//! source observes the new limits on its next query.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sources tracked before the cleanup task prunes.
pub const MAX_TRACKED_SOURCES: usize = 10_000;

/// Entries kept after a prune.
pub const PRUNE_TARGET: usize = 5_000;

/// How often the cleanup task looks at the map.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

type SourceBucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct BucketEntry {
    bucket: SourceBucket,
    created_at: Instant,
    last_access_ms: AtomicU64,
}

impl BucketEntry {
    fn new(quota: Quota) -> Self {
        Self {
            bucket: GovernorLimiter::direct(quota),
            created_at: Instant::now(),
            last_access_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_access_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_ms(&self) -> u64 {
        let now = self.created_at.elapsed().as_millis() as u64;
        now.saturating_sub(self.last_access_ms.load(Ordering::Relaxed))
    }
}

/// Counters for the limiter; all lock-free.
#[derive(Debug, Default)]
pub struct RateLimiterStats {
    total: AtomicU64,
    allowed: AtomicU64,
    rejected: AtomicU64,
    pruned: AtomicU64,
}

impl RateLimiterStats {
    /// Total allow() calls.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Calls that consumed a token.
    #[must_use]
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    /// Calls denied for lack of tokens.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Buckets dropped by cleanup.
    #[must_use]
    pub fn pruned(&self) -> u64 {
        self.pruned.load(Ordering::Relaxed)
    }
}

/// Per-source token-bucket rate limiter.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, BucketEntry>,
    limits: RwLock<(u32, u32)>,
    enabled: bool,
    stats: RateLimiterStats,
    warned_invalid: AtomicBool,
}

impl RateLimiter {
    /// Create a limiter adding `rate` tokens per second into buckets of
    /// `burst` capacity. Zero values are clamped to 1.
    #[must_use]
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            limits: RwLock::new((rate.max(1), burst.max(1))),
            enabled: true,
            stats: RateLimiterStats::default(),
            warned_invalid: AtomicBool::new(false),
        }
    }

    /// Create a limiter that always allows.
    #[must_use]
    pub fn disabled() -> Self {
        let mut limiter = Self::new(1, 1);
        limiter.enabled = false;
        limiter
    }

    /// Whether limiting is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn quota(&self) -> Quota {
        let (rate, burst) = *self.limits.read();
        let rate = NonZeroU32::new(rate.max(1)).expect("rate clamped to >= 1");
        let burst = NonZeroU32::new(burst.max(1)).expect("burst clamped to >= 1");
        Quota::per_second(rate).allow_burst(burst)
    }

    /// Consume one token for `source`; returns whether it was available.
    ///
    /// The unspecified address (0.0.0.0 / ::) cannot be attributed to a
    /// client and is always allowed; the condition is logged once.
    pub fn allow(&self, source: IpAddr) -> bool {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        if !self.enabled {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if source.is_unspecified() {
            if !self.warned_invalid.swap(true, Ordering::Relaxed) {
                warn!("rate limiter saw an unspecified source address, allowing");
            }
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let entry = self
            .buckets
            .entry(source)
            .or_insert_with(|| BucketEntry::new(self.quota()));
        entry.touch();

        match entry.bucket.check() {
            Ok(()) => {
                self.stats.allowed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(source = %source, "rate limit exceeded");
                false
            }
        }
    }

    /// Replace the rate and burst; existing buckets are reset so every
    /// source picks up the new limits on its next query.
    pub fn update_limits(&self, rate: u32, burst: u32) {
        *self.limits.write() = (rate.max(1), burst.max(1));
        self.buckets.clear();
        info!(rate, burst, "updated rate limits");
    }

    /// The configured (rate, burst).
    #[must_use]
    pub fn limits(&self) -> (u32, u32) {
        *self.limits.read()
    }

    /// Number of live buckets.
    #[must_use]
    pub fn active_sources(&self) -> usize {
        self.buckets.len()
    }

    /// Statistics handle.
    #[must_use]
    pub fn stats(&self) -> &RateLimiterStats {
        &self.stats
    }

    /// Prune the map down to [`PRUNE_TARGET`] when it has grown past
    /// [`MAX_TRACKED_SOURCES`], dropping the longest-idle buckets first.
    /// Returns how many were removed.
    pub fn prune(&self) -> usize {
        if self.buckets.len() <= MAX_TRACKED_SOURCES {
            return 0;
        }

        let mut idle: Vec<(IpAddr, u64)> = self
            .buckets
            .iter()
            .map(|e| (*e.key(), e.value().idle_ms()))
            .collect();
        idle.sort_by(|a, b| b.1.cmp(&a.1));

        let excess = idle.len().saturating_sub(PRUNE_TARGET);
        let mut removed = 0;
        for (addr, _) in idle.into_iter().take(excess) {
            if self.buckets.remove(&addr).is_some() {
                removed += 1;
            }
        }

        self.stats.pruned.fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, kept = self.buckets.len(), "pruned rate limiter buckets");
        removed
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

/// Spawn the periodic cleanup; exits when `stop` flips to true.
pub fn spawn_cleanup(
    limiter: std::sync::Arc<RateLimiter>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    limiter.prune();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
