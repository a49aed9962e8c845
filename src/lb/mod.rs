//! Backend selection for answer sets.
//!
//! When a name has several address records, the handler can hand the
//! record set to the load balancer and answer with exactly one backend.
//! Backends are grouped by `<fqdn>:<TYPE>`; each group keeps its own lock
//! and an atomic selection counter, and only backends that are healthy and
//! enabled are candidates. An empty candidate set yields no selection and
//! the handler falls back to returning the whole record set.
//!
//! # Strategies
//!
//! | Strategy | Selection |
//! |-----------|-----------|
//! | round-robin | counter modulo candidates |
//! | weighted-round-robin | counter modulo total weight, walk the weight prefix sum |
//! | least-connections | smallest connection counter, incremented on pick |
//! | random | counter-based pseudo-random pick |

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::health::HealthCheckService;
use crate::zone::{fqdn, Record, RecordType};

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Cycle through candidates in order.
    #[default]
    RoundRobin,
    /// Cycle weighted by backend weight; non-positive weights count as 1.
    WeightedRoundRobin,
    /// Pick the candidate with the fewest recorded connections.
    LeastConnections,
    /// Counter-based pseudo-random pick.
    Random,
}

impl Strategy {
    /// The configuration name of this strategy.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::LeastConnections => "least-connections",
            Self::Random => "random",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "round_robin" => Ok(Self::RoundRobin),
            "weighted-round-robin" | "weighted_round_robin" | "weighted" => {
                Ok(Self::WeightedRoundRobin)
            }
            "least-connections" | "least_connections" => Ok(Self::LeastConnections),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown load balancer strategy: {other}")),
        }
    }
}

/// One answer candidate.
#[derive(Debug)]
pub struct Backend {
    /// The record this backend answers with.
    pub record: Record,
    /// Weight for the weighted strategy.
    pub weight: u32,
    /// Health flag, written by the health checker integration.
    pub healthy: bool,
    /// Operator switch.
    pub enabled: bool,
    /// Selections recorded for least-connections. Monotonic: DNS has no
    /// request-termination signal to decrement on.
    connections: AtomicU64,
}

impl Backend {
    fn new(record: Record, weight: u32) -> Self {
        Self {
            record,
            weight,
            healthy: true,
            enabled: true,
            connections: AtomicU64::new(0),
        }
    }

    /// The backend identity: the record's rdata serialization.
    #[must_use]
    pub fn value(&self) -> String {
        self.record.rdata_string()
    }

    /// Recorded connection count.
    #[must_use]
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// All backends for one (name, type) pair.
pub struct BackendGroup {
    backends: RwLock<Vec<Backend>>,
    counter: AtomicU64,
    strategy: Strategy,
}

impl BackendGroup {
    fn new(strategy: Strategy) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            counter: AtomicU64::new(0),
            strategy,
        }
    }

    /// Pick the next backend record, or `None` when no candidate is both
    /// healthy and enabled (and passes the health service, when attached).
    fn next(&self, health: Option<&HealthCheckService>) -> Option<Record> {
        let backends = self.backends.read();
        let candidates: Vec<&Backend> = backends
            .iter()
            .filter(|b| b.healthy && b.enabled)
            .filter(|b| match health {
                Some(service) => service.is_healthy(&b.value()),
                None => true,
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            Strategy::RoundRobin | Strategy::Random => {
                let index =
                    self.counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
                candidates[index]
            }
            Strategy::WeightedRoundRobin => self.next_weighted(&candidates),
            Strategy::LeastConnections => {
                let backend = candidates
                    .iter()
                    .min_by_key(|b| b.connections())
                    .expect("candidates is non-empty");
                backend.connections.fetch_add(1, Ordering::Relaxed);
                backend
            }
        };

        Some(selected.record.clone())
    }

    fn next_weighted<'a>(&self, candidates: &[&'a Backend]) -> &'a Backend {
        let total: u64 = candidates.iter().map(|b| u64::from(b.weight.max(1))).sum();
        let target = self.counter.fetch_add(1, Ordering::Relaxed) % total;

        let mut cumulative = 0u64;
        for backend in candidates {
            cumulative += u64::from(backend.weight.max(1));
            if target < cumulative {
                return backend;
            }
        }
        candidates[0]
    }

    /// Reconcile the group with `records`: add backends for new values,
    /// drop backends whose value disappeared, keep state for the rest.
    fn sync(&self, records: &[Record]) {
        let mut backends = self.backends.write();

        let wanted: Vec<String> = records.iter().map(Record::rdata_string).collect();
        backends.retain(|b| wanted.contains(&b.value()));

        for record in records {
            let value = record.rdata_string();
            if !backends.iter().any(|b| b.value() == value) {
                backends.push(Backend::new(record.clone(), 1));
            }
        }
    }

    fn set_health(&self, value: &str, healthy: bool) {
        let mut backends = self.backends.write();
        for backend in backends.iter_mut() {
            if backend.value() == value {
                backend.healthy = healthy;
            }
        }
    }

    fn set_enabled(&self, value: &str, enabled: bool) {
        let mut backends = self.backends.write();
        for backend in backends.iter_mut() {
            if backend.value() == value {
                backend.enabled = enabled;
            }
        }
    }

    fn set_weight(&self, value: &str, weight: u32) {
        let mut backends = self.backends.write();
        for backend in backends.iter_mut() {
            if backend.value() == value {
                backend.weight = weight;
            }
        }
    }

    fn counts(&self) -> (usize, usize) {
        let backends = self.backends.read();
        let healthy = backends.iter().filter(|b| b.healthy && b.enabled).count();
        (backends.len(), healthy)
    }
}

/// Load balancer over backend groups keyed by `<fqdn>:<TYPE>`.
pub struct LoadBalancer {
    groups: RwLock<HashMap<String, Arc<BackendGroup>>>,
    strategy: Strategy,
    health: Option<Arc<HealthCheckService>>,
}

impl LoadBalancer {
    /// Create a load balancer using `strategy` for every group.
    #[must_use]
    pub fn new(strategy: Strategy) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            strategy,
            health: None,
        }
    }

    /// Attach a health service; backends are then additionally gated on
    /// its verdict for their value at each selection.
    #[must_use]
    pub fn with_health(mut self, health: Arc<HealthCheckService>) -> Self {
        self.health = Some(health);
        self
    }

    /// The configured strategy.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn key(name: &str, rtype: RecordType) -> String {
        format!("{}:{}", fqdn(name), rtype)
    }

    fn group(&self, key: &str) -> Option<Arc<BackendGroup>> {
        self.groups.read().get(key).cloned()
    }

    fn group_or_create(&self, key: &str) -> Arc<BackendGroup> {
        if let Some(group) = self.group(key) {
            return group;
        }
        let mut groups = self.groups.write();
        groups
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(BackendGroup::new(self.strategy)))
            .clone()
    }

    /// Reconcile the group for (`name`, `rtype`) with the current record
    /// set. The records remain the source of truth; backend state for
    /// surviving values is preserved.
    pub fn sync_backends(&self, name: &str, rtype: RecordType, records: &[Record]) {
        let key = Self::key(name, rtype);
        self.group_or_create(&key).sync(records);
    }

    /// Pick the next backend for (`name`, `rtype`).
    #[must_use]
    pub fn next(&self, name: &str, rtype: RecordType) -> Option<Record> {
        let key = Self::key(name, rtype);
        let selected = self.group(&key)?.next(self.health.as_deref());
        if let Some(record) = &selected {
            debug!(group = %key, backend = %record.rdata_string(), "load balancer selected backend");
        }
        selected
    }

    /// Mark a backend healthy or unhealthy by its value.
    pub fn set_backend_health(&self, name: &str, rtype: RecordType, value: &str, healthy: bool) {
        if let Some(group) = self.group(&Self::key(name, rtype)) {
            group.set_health(value, healthy);
        }
    }

    /// Enable or disable a backend by its value.
    pub fn set_backend_enabled(&self, name: &str, rtype: RecordType, value: &str, enabled: bool) {
        if let Some(group) = self.group(&Self::key(name, rtype)) {
            group.set_enabled(value, enabled);
        }
    }

    /// Set a backend's weight by its value.
    pub fn set_backend_weight(&self, name: &str, rtype: RecordType, value: &str, weight: u32) {
        if let Some(group) = self.group(&Self::key(name, rtype)) {
            group.set_weight(value, weight);
        }
    }

    /// (total, healthy+enabled) backend counts across all groups, for the
    /// metrics gauges.
    #[must_use]
    pub fn backend_counts(&self) -> (usize, usize) {
        let groups = self.groups.read();
        let mut total = 0;
        let mut healthy = 0;
        for group in groups.values() {
            let (t, h) = group.counts();
            total += t;
            healthy += h;
        }
        (total, healthy)
    }

    /// Number of backend groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }
}
