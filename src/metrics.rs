//! Metrics registry.
//!
//! Every pipeline stage reports here through a method call; this module
//! never reaches into other components. Observations flow through the
//! `metrics` facade and are exposed in Prometheus format by an HTTP
//! listener installed at startup.
//!
//! # Series
//!
//! Counters: `godns_query_total{type,rcode}`, `godns_query_errors_total
//! {type,error}`, `godns_cache_{hits,misses,evictions}_total`,
//! `godns_rate_limited_queries_total`, `godns_upstream_{queries,errors}_total`,
//! `godns_backend_requests_total{backend,status}`,
//! `godns_health_check_{success,failure}_total{target,type}`.
//!
//! Gauges: `godns_cache_size`, `godns_active_rate_limiters`,
//! `godns_backend_{total,healthy}`, `godns_health_check_total`.
//!
//! Histograms: `godns_query_duration_seconds{type}`,
//! `godns_upstream_duration_seconds`,
//! `godns_health_check_latency_seconds{target,type}`.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Handle through which components record observations.
///
/// The handle is cheap to clone; label values are owned strings because
/// the facade retains them per series.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    /// Create a metrics handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Install the Prometheus exposition listener on `addr`.
    ///
    /// # Errors
    ///
    /// Fails when the exporter cannot bind or a recorder is already
    /// installed.
    pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(addr = %addr, "metrics exporter listening");
        Ok(())
    }

    /// One query completed: type, rcode, and wall time.
    pub fn record_query(&self, qtype: &str, rcode: &str, duration_secs: f64) {
        counter!(
            "godns_query_total",
            "type" => qtype.to_string(),
            "rcode" => rcode.to_string()
        )
        .increment(1);
        histogram!("godns_query_duration_seconds", "type" => qtype.to_string())
            .record(duration_secs);
    }

    /// A query failed inside the pipeline.
    pub fn record_query_error(&self, qtype: &str, error: &str) {
        counter!(
            "godns_query_errors_total",
            "type" => qtype.to_string(),
            "error" => error.to_string()
        )
        .increment(1);
    }

    /// Cache hit.
    pub fn record_cache_hit(&self) {
        counter!("godns_cache_hits_total").increment(1);
    }

    /// Cache miss.
    pub fn record_cache_miss(&self) {
        counter!("godns_cache_misses_total").increment(1);
    }

    /// Cache eviction.
    pub fn record_cache_eviction(&self) {
        counter!("godns_cache_evictions_total").increment(1);
    }

    /// Current cache entry count.
    pub fn set_cache_size(&self, size: u64) {
        gauge!("godns_cache_size").set(size as f64);
    }

    /// A query was refused by the rate limiter.
    pub fn record_rate_limited(&self) {
        counter!("godns_rate_limited_queries_total").increment(1);
    }

    /// Current number of live rate-limiter buckets.
    pub fn set_active_rate_limiters(&self, count: u64) {
        gauge!("godns_active_rate_limiters").set(count as f64);
    }

    /// A query was forwarded upstream.
    pub fn record_upstream_query(&self, duration_secs: f64) {
        counter!("godns_upstream_queries_total").increment(1);
        histogram!("godns_upstream_duration_seconds").record(duration_secs);
    }

    /// An upstream exchange failed.
    pub fn record_upstream_error(&self) {
        counter!("godns_upstream_errors_total").increment(1);
    }

    /// A backend answered (or the group fell back).
    pub fn record_backend_request(&self, backend: &str, status: &str) {
        counter!(
            "godns_backend_requests_total",
            "backend" => backend.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    /// Current backend totals.
    pub fn set_backend_counts(&self, total: u64, healthy: u64) {
        gauge!("godns_backend_total").set(total as f64);
        gauge!("godns_backend_healthy").set(healthy as f64);
    }

    /// Number of registered health checks.
    pub fn set_health_check_total(&self, count: u64) {
        gauge!("godns_health_check_total").set(count as f64);
    }

    /// A probe succeeded.
    pub fn record_health_check_success(&self, target: &str, check_type: &str, latency_secs: f64) {
        counter!(
            "godns_health_check_success_total",
            "target" => target.to_string(),
            "type" => check_type.to_string()
        )
        .increment(1);
        histogram!(
            "godns_health_check_latency_seconds",
            "target" => target.to_string(),
            "type" => check_type.to_string()
        )
        .record(latency_secs);
    }

    /// A probe failed.
    pub fn record_health_check_failure(&self, target: &str, check_type: &str, latency_secs: f64) {
        counter!(
            "godns_health_check_failure_total",
            "target" => target.to_string(),
            "type" => check_type.to_string()
        )
        .increment(1);
        histogram!(
            "godns_health_check_latency_seconds",
            "target" => target.to_string(),
            "type" => check_type.to_string()
        )
        .record(latency_secs);
    }
}
