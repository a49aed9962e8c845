//! Query logging.
//!
//! Each answered query appends one entry to a bounded in-memory buffer
//! and bumps three counters (total, cached, blocked). A full buffer
//! flushes; flushing drains the entries through the structured logger as
//! JSON lines. A background task flushes on the configured interval, and
//! a second one serialises the counters to `dns:stats:*` every 30 seconds
//! so restarts and sibling instances keep the running totals.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::KeyValueStore;

/// How often counters are persisted to the store.
pub const STATS_PERSIST_INTERVAL: Duration = Duration::from_secs(30);

const TOTAL_KEY: &str = "dns:stats:total_queries";
const CACHED_KEY: &str = "dns:stats:cached_queries";
const BLOCKED_KEY: &str = "dns:stats:blocked_queries";

/// One logged query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryLogEntry {
    /// When the query finished.
    pub timestamp: DateTime<Utc>,
    /// Source address.
    pub client_ip: String,
    /// Queried name.
    pub query_name: String,
    /// Queried type.
    pub query_type: String,
    /// Response code written back.
    pub response_code: String,
    /// Number of answers in the response.
    pub answer_count: usize,
    /// Wall time for the whole pipeline.
    pub latency_ms: i64,
    /// Whether the response came from the cache.
    pub cache_hit: bool,
    /// Whether the response came from the upstream resolver.
    pub upstream: bool,
    /// Whether the query was refused by the rate limiter.
    pub blocked: bool,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCounters {
    /// All logged queries.
    pub total: u64,
    /// Queries answered from cache.
    pub cached: u64,
    /// Queries refused by the rate limiter.
    pub blocked: u64,
}

/// Ring-buffered query log with persisted counters.
pub struct QueryLogService {
    store: Arc<dyn KeyValueStore>,
    enabled: AtomicBool,
    buffer: Mutex<Vec<QueryLogEntry>>,
    buffer_size: usize,
    total: AtomicU64,
    cached: AtomicU64,
    blocked: AtomicU64,
}

impl QueryLogService {
    /// Create a logger buffering up to `buffer_size` entries.
    pub fn new(store: Arc<dyn KeyValueStore>, buffer_size: usize) -> Self {
        Self {
            store,
            enabled: AtomicBool::new(true),
            buffer: Mutex::new(Vec::with_capacity(buffer_size)),
            buffer_size: buffer_size.max(1),
            total: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Load counters persisted by a previous run (or a sibling instance).
    /// Missing or malformed values leave the counter at zero.
    pub async fn restore_counters(&self) {
        for (key, counter) in [
            (TOTAL_KEY, &self.total),
            (CACHED_KEY, &self.cached),
            (BLOCKED_KEY, &self.blocked),
        ] {
            match self.store.get(key).await {
                Ok(value) => match value.parse::<u64>() {
                    Ok(count) => {
                        counter.store(count, Ordering::Relaxed);
                        info!(key, count, "restored query counter");
                    }
                    Err(err) => warn!(key, value, error = %err, "unparseable query counter"),
                },
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(key, error = %err, "failed to restore query counter"),
            }
        }
    }

    /// Write the three counters to the store as decimal strings.
    pub async fn persist_counters(&self) {
        for (key, counter) in [
            (TOTAL_KEY, &self.total),
            (CACHED_KEY, &self.cached),
            (BLOCKED_KEY, &self.blocked),
        ] {
            let value = counter.load(Ordering::Relaxed).to_string();
            if let Err(err) = self.store.set(key, &value).await {
                warn!(key, error = %err, "failed to persist query counter");
            }
        }
    }

    /// Append one entry; flushes when the buffer reaches capacity.
    #[allow(clippy::too_many_arguments)]
    pub fn log_query(
        &self,
        client: IpAddr,
        qname: &str,
        qtype: &str,
        rcode: &str,
        answer_count: usize,
        latency: Duration,
        cache_hit: bool,
        upstream: bool,
        blocked: bool,
    ) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cached.fetch_add(1, Ordering::Relaxed);
        }
        if blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }

        let entry = QueryLogEntry {
            timestamp: Utc::now(),
            client_ip: client.to_string(),
            query_name: qname.to_string(),
            query_type: qtype.to_string(),
            response_code: rcode.to_string(),
            answer_count,
            latency_ms: latency.as_millis() as i64,
            cache_hit,
            upstream,
            blocked,
        };

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(entry);
            buffer.len() >= self.buffer_size
        };

        if should_flush {
            self.flush();
        }
    }

    /// Drain the buffer through the structured logger.
    pub fn flush(&self) {
        let drained: Vec<QueryLogEntry> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        for entry in &drained {
            match serde_json::to_string(entry) {
                Ok(line) => info!(target: "valdns::querylog", "{line}"),
                Err(err) => warn!(error = %err, "failed to encode query log entry"),
            }
        }
        debug!(count = drained.len(), "flushed query log buffer");
    }

    /// The most recent `count` buffered entries.
    #[must_use]
    pub fn recent(&self, count: usize) -> Vec<QueryLogEntry> {
        let buffer = self.buffer.lock();
        let start = buffer.len().saturating_sub(count);
        buffer[start..].to_vec()
    }

    /// Current counter values.
    #[must_use]
    pub fn counters(&self) -> QueryCounters {
        QueryCounters {
            total: self.total.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }

    /// Entries currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Turn logging on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether logging is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Spawn the periodic flush; exits (after a final flush) when `stop`
/// flips to true.
pub fn spawn_flush(
    log: Arc<QueryLogService>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => log.flush(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        log.flush();
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the periodic counter persistence; exits (after a final persist)
/// when `stop` flips to true.
pub fn spawn_stats_persistence(
    log: Arc<QueryLogService>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_PERSIST_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => log.persist_counters().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        log.persist_counters().await;
                        break;
                    }
                }
            }
        }
    })
}
