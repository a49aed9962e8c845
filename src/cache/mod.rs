//! In-memory DNS response cache.
//!
//! Maps a fingerprint of (lower-case qname, qtype) to a cached response
//! with a per-entry TTL and LRU eviction at capacity, backed by moka.
//!
//! # TTL rule
//!
//! - responses with answers expire after the minimum answer TTL, capped
//!   above by the configured default;
//! - responses without answers expire after the configured default.
//!
//! `get` returns a deep copy with the caller's query id substituted, so
//! cached bytes are never shared between queries. A background task runs
//! pending maintenance once a minute to sweep expired entries in bulk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType as WireType;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use tokio::sync::watch;
use tracing::debug;

use crate::zone::fqdn;

/// How often the background sweep runs.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Cache fingerprint: lower-case dot-terminated name plus query type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: WireType,
}

impl CacheKey {
    /// Build a fingerprint, normalizing the name.
    #[must_use]
    pub fn new(name: &str, qtype: WireType) -> Self {
        Self {
            name: fqdn(name),
            qtype,
        }
    }

    /// The normalized name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The query type.
    #[must_use]
    pub fn qtype(&self) -> WireType {
        self.qtype
    }
}

/// A cached response plus its expiry bookkeeping.
#[derive(Clone)]
struct CachedResponse {
    message: Message,
    inserted_at: Instant,
    ttl: Duration,
}

impl CachedResponse {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

struct PerEntryTtl;

impl Expiry<CacheKey, CachedResponse> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Cache statistics; atomic so any thread can read them live.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries evicted for capacity.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// TTL + LRU response cache.
pub struct ResponseCache {
    cache: Cache<CacheKey, CachedResponse>,
    default_ttl: Duration,
    enabled: bool,
    stats: Arc<CacheStats>,
}

impl ResponseCache {
    /// Create a cache holding up to `max_entries` responses with the given
    /// default TTL.
    #[must_use]
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        let stats = Arc::new(CacheStats::default());
        let stats_for_listener = Arc::clone(&stats);

        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .eviction_listener(move |_key, _value, cause| {
                if cause == RemovalCause::Size {
                    stats_for_listener.evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            cache,
            default_ttl,
            enabled: true,
            stats,
        }
    }

    /// Create a cache that never stores anything.
    #[must_use]
    pub fn disabled() -> Self {
        let mut cache = Self::new(0, Duration::from_secs(0));
        cache.enabled = false;
        cache
    }

    /// Whether this cache stores responses.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a response, returning a deep copy with `query_id`
    /// substituted. Misses and expired entries count as misses; an expired
    /// entry is removed on the way out.
    #[must_use]
    pub fn get(&self, key: &CacheKey, query_id: u16) -> Option<Message> {
        if !self.enabled {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.cache.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let mut message = entry.message.clone();
                message.set_id(query_id);
                Some(message)
            }
            Some(_) => {
                self.cache.invalidate(key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a deep copy of `response` under `key` with the effective TTL.
    pub fn insert(&self, key: CacheKey, response: &Message) {
        if !self.enabled {
            return;
        }

        let ttl = self.effective_ttl(response);
        if ttl.is_zero() {
            return;
        }

        self.cache.insert(
            key,
            CachedResponse {
                message: response.clone(),
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Effective TTL for a response under the configured default.
    fn effective_ttl(&self, response: &Message) -> Duration {
        let answers = response.answers();
        if answers.is_empty() {
            return self.default_ttl;
        }

        let min_ttl = answers.iter().map(|r| r.ttl()).min().unwrap_or(0);
        Duration::from_secs(u64::from(min_ttl)).min(self.default_ttl)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        debug!("response cache cleared");
    }

    /// Current entry count. Approximate under concurrency.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics handle.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Process pending expirations and evictions now.
    pub fn run_maintenance(&self) {
        self.cache.run_pending_tasks();
    }
}

/// Spawn the periodic maintenance sweep; exits when `stop` flips to true.
pub fn spawn_maintenance(
    cache: Arc<ResponseCache>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => cache.run_maintenance(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Header, MessageType, Query, ResponseCode};
    use hickory_proto::rr::{rdata, Name, RData, Record};
    use std::net::Ipv4Addr;

    fn make_response(name: &str, ttl: u32, id: u16) -> Message {
        let mut message = Message::new();
        let mut header = Header::new();
        header.set_id(id);
        header.set_message_type(MessageType::Response);
        header.set_response_code(ResponseCode::NoError);
        message.set_header(header);

        let owner = Name::from_ascii(name).unwrap();
        message.add_query(Query::query(owner.clone(), WireType::A));
        message.add_answer(Record::from_rdata(
            owner,
            ttl,
            RData::A(rdata::A(Ipv4Addr::new(192, 0, 2, 10))),
        ));
        message
    }

    fn empty_response(id: u16) -> Message {
        let mut message = Message::new();
        let mut header = Header::new();
        header.set_id(id);
        header.set_message_type(MessageType::Response);
        message.set_header(header);
        message
    }

    #[test]
    fn test_key_normalization() {
        let a = CacheKey::new("WWW.Example.LAN", WireType::A);
        let b = CacheKey::new("www.example.lan.", WireType::A);
        assert_eq!(a, b);

        let c = CacheKey::new("www.example.lan.", WireType::AAAA);
        assert_ne!(a, c);
    }

    #[test]
    fn test_insert_and_get_substitutes_id() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));
        let key = CacheKey::new("www.example.lan.", WireType::A);

        cache.insert(key.clone(), &make_response("www.example.lan.", 300, 0x1111));

        let hit = cache.get(&key, 0x2222).unwrap();
        assert_eq!(hit.id(), 0x2222);
        assert_eq!(hit.answers().len(), 1);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[test]
    fn test_get_returns_deep_copy() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));
        let key = CacheKey::new("www.example.lan.", WireType::A);
        cache.insert(key.clone(), &make_response("www.example.lan.", 300, 1));

        let mut first = cache.get(&key, 2).unwrap();
        first.set_id(9999);
        first.add_query(Query::query(
            Name::from_ascii("mutated.example.lan.").unwrap(),
            WireType::A,
        ));

        let second = cache.get(&key, 3).unwrap();
        assert_eq!(second.id(), 3);
        assert_eq!(second.queries().len(), 1);
    }

    #[test]
    fn test_miss_counts() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));
        let key = CacheKey::new("missing.example.lan.", WireType::A);
        assert!(cache.get(&key, 1).is_none());
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_effective_ttl_min_answer_capped_by_default() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));

        // Answer TTL below the default wins.
        let ttl = cache.effective_ttl(&make_response("x.lan.", 60, 1));
        assert_eq!(ttl, Duration::from_secs(60));

        // Answer TTL above the default is capped.
        let ttl = cache.effective_ttl(&make_response("x.lan.", 86400, 1));
        assert_eq!(ttl, Duration::from_secs(300));

        // No answers: configured default.
        let ttl = cache.effective_ttl(&empty_response(1));
        assert_eq!(ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));
        let key = CacheKey::new("short.example.lan.", WireType::A);

        // One-second answer TTL.
        cache.insert(key.clone(), &make_response("short.example.lan.", 1, 1));
        assert!(cache.get(&key, 2).is_some());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get(&key, 3).is_none());
    }

    #[test]
    fn test_zero_ttl_not_stored() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));
        let key = CacheKey::new("zero.example.lan.", WireType::A);
        cache.insert(key.clone(), &make_response("zero.example.lan.", 0, 1));
        assert!(cache.get(&key, 2).is_none());
    }

    #[test]
    fn test_clear() {
        let cache = ResponseCache::new(100, Duration::from_secs(300));
        let key = CacheKey::new("www.example.lan.", WireType::A);
        cache.insert(key.clone(), &make_response("www.example.lan.", 300, 1));
        assert!(cache.get(&key, 2).is_some());

        cache.clear();
        assert!(cache.get(&key, 3).is_none());
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = ResponseCache::disabled();
        assert!(!cache.is_enabled());

        let key = CacheKey::new("www.example.lan.", WireType::A);
        cache.insert(key.clone(), &make_response("www.example.lan.", 300, 1));
        assert!(cache.get(&key, 2).is_none());
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = ResponseCache::new(4, Duration::from_secs(300));

        for i in 0..16u16 {
            let name = format!("host{i}.example.lan.");
            let key = CacheKey::new(&name, WireType::A);
            cache.insert(key, &make_response(&name, 300, i));
        }
        cache.run_maintenance();

        assert!(cache.len() <= 8, "cache should stay near capacity");
    }

    #[tokio::test]
    async fn test_maintenance_task_stops() {
        let cache = Arc::new(ResponseCache::new(10, Duration::from_secs(300)));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn_maintenance(Arc::clone(&cache), stop_rx);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("maintenance task should observe the stop signal")
            .unwrap();
    }
}
