//! Active backend health checking.
//!
//! Each registered target gets its own worker task: one immediate probe,
//! then one every interval until the service is stopped. Results land in
//! a single-lock map that the load balancer consults on selection.
//!
//! Probe definitions:
//!
//! - **TCP**: connection established within the timeout
//! - **HTTP/HTTPS**: a 2xx answer to a GET of the configured path
//! - **ICMP**: treated as TCP to port 80; raw sockets are never required

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// Kind of probe to run against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// TCP connect.
    Tcp,
    /// HTTP GET expecting 2xx.
    Http,
    /// HTTPS GET expecting 2xx.
    Https,
    /// Ping stand-in: TCP connect to port 80.
    Icmp,
}

impl CheckType {
    /// Canonical name, used as a metrics label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Icmp => "ICMP",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One health check definition.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Host to probe (IP literal or name).
    pub host: String,
    /// Port to probe.
    pub port: u16,
    /// Probe kind.
    pub check_type: CheckType,
    /// Time between probes.
    pub interval: Duration,
    /// Deadline for each probe.
    pub timeout: Duration,
    /// Path for HTTP(S) probes; empty means `/`.
    pub path: String,
}

impl HealthCheck {
    /// A TCP check with the given cadence.
    #[must_use]
    pub fn tcp(host: &str, port: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            check_type: CheckType::Tcp,
            interval,
            timeout,
            path: String::new(),
        }
    }

    /// An HTTP check of `path` with the given cadence.
    #[must_use]
    pub fn http(host: &str, port: u16, path: &str, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            check_type: CheckType::Http,
            interval,
            timeout,
            path: path.to_string(),
        }
    }
}

/// Latest probe outcome for one target.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Target key.
    pub target: String,
    /// Whether the last probe succeeded.
    pub healthy: bool,
    /// When the last probe finished.
    pub last_check: DateTime<Utc>,
    /// Probe duration.
    pub latency: Duration,
    /// Human-readable outcome.
    pub message: String,
}

/// Health check service: one worker per target, results behind one lock.
pub struct HealthCheckService {
    results: Arc<RwLock<HashMap<String, HealthCheckResult>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    http: reqwest::Client,
    metrics: Metrics,
}

impl HealthCheckService {
    /// Create a service with no checks registered.
    #[must_use]
    pub fn new(metrics: Metrics) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            results: Arc::new(RwLock::new(HashMap::new())),
            workers: Mutex::new(Vec::new()),
            stop_tx,
            stop_rx,
            http: reqwest::Client::new(),
            metrics,
        }
    }

    /// Register `check` under `target` and start its worker. The target
    /// is reported healthy until the first probe lands.
    pub fn add_check(&self, target: &str, check: HealthCheck) {
        {
            let mut results = self.results.write();
            results.insert(
                target.to_string(),
                HealthCheckResult {
                    target: target.to_string(),
                    healthy: true,
                    last_check: Utc::now(),
                    latency: Duration::ZERO,
                    message: "waiting for first probe".to_string(),
                },
            );
            self.metrics.set_health_check_total(results.len() as u64);
        }

        info!(target, check = %check.check_type, interval = ?check.interval, "registered health check");

        let worker = Worker {
            target: target.to_string(),
            check,
            results: Arc::clone(&self.results),
            http: self.http.clone(),
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(worker.run(self.stop_rx.clone()));
        self.workers.lock().push(handle);
    }

    /// Drop the check and result for `target`. The worker observes the
    /// removal on its next wakeup and exits.
    pub fn remove_check(&self, target: &str) {
        let mut results = self.results.write();
        results.remove(target);
        self.metrics.set_health_check_total(results.len() as u64);
        info!(target, "removed health check");
    }

    /// Health verdict for `target`; targets without a check are healthy.
    #[must_use]
    pub fn is_healthy(&self, target: &str) -> bool {
        self.results
            .read()
            .get(target)
            .map_or(true, |result| result.healthy)
    }

    /// The latest result for `target`.
    #[must_use]
    pub fn result(&self, target: &str) -> Option<HealthCheckResult> {
        self.results.read().get(target).cloned()
    }

    /// All latest results.
    #[must_use]
    pub fn all_results(&self) -> Vec<HealthCheckResult> {
        self.results.read().values().cloned().collect()
    }

    /// (registered, healthy) counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let results = self.results.read();
        let healthy = results.values().filter(|r| r.healthy).count();
        (results.len(), healthy)
    }

    /// Signal every worker to stop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

struct Worker {
    target: String,
    check: HealthCheck,
    results: Arc<RwLock<HashMap<String, HealthCheckResult>>>,
    http: reqwest::Client,
    metrics: Metrics,
}

impl Worker {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        // First probe immediately, then on the interval.
        self.probe_and_record().await;

        let mut ticker = tokio::time::interval(self.check.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.results.read().contains_key(&self.target) {
                        debug!(target = %self.target, "health check removed, worker exiting");
                        return;
                    }
                    self.probe_and_record().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn probe_and_record(&self) {
        let started = Instant::now();
        let (healthy, message) = self.probe().await;
        let latency = started.elapsed();

        if healthy {
            self.metrics.record_health_check_success(
                &self.target,
                self.check.check_type.as_str(),
                latency.as_secs_f64(),
            );
            debug!(target = %self.target, latency = ?latency, "health check passed");
        } else {
            self.metrics.record_health_check_failure(
                &self.target,
                self.check.check_type.as_str(),
                latency.as_secs_f64(),
            );
            warn!(target = %self.target, message = %message, latency = ?latency, "health check failed");
        }

        let mut results = self.results.write();
        // Skip the write when the check was removed mid-probe.
        if let Some(entry) = results.get_mut(&self.target) {
            *entry = HealthCheckResult {
                target: self.target.clone(),
                healthy,
                last_check: Utc::now(),
                latency,
                message,
            };
        }
    }

    async fn probe(&self) -> (bool, String) {
        match self.check.check_type {
            CheckType::Tcp => self.probe_tcp(self.check.port).await,
            CheckType::Icmp => self.probe_tcp(80).await,
            CheckType::Http => self.probe_http("http").await,
            CheckType::Https => self.probe_http("https").await,
        }
    }

    async fn probe_tcp(&self, port: u16) -> (bool, String) {
        let address = format_host_port(&self.check.host, port);
        match timeout(self.check.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => (true, "TCP connection successful".to_string()),
            Ok(Err(err)) => (false, format!("TCP connection failed: {err}")),
            Err(_) => (
                false,
                format!("TCP connection timed out after {:?}", self.check.timeout),
            ),
        }
    }

    async fn probe_http(&self, scheme: &str) -> (bool, String) {
        let path = if self.check.path.is_empty() {
            "/"
        } else {
            &self.check.path
        };
        let url = format!(
            "{scheme}://{}{path}",
            format_host_port(&self.check.host, self.check.port)
        );

        match self
            .http
            .get(&url)
            .timeout(self.check.timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                (true, format!("HTTP {} OK", response.status().as_u16()))
            }
            Ok(response) => (false, format!("HTTP {}", response.status().as_u16())),
            Err(err) => (false, format!("HTTP request failed: {err}")),
        }
    }
}

/// Join host and port, bracketing IPv6 literals.
fn format_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn service() -> HealthCheckService {
        HealthCheckService::new(Metrics::new())
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..50 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met within a second");
    }

    #[test]
    fn test_check_type_names() {
        assert_eq!(CheckType::Tcp.as_str(), "TCP");
        assert_eq!(CheckType::Http.as_str(), "HTTP");
        assert_eq!(CheckType::Https.as_str(), "HTTPS");
        assert_eq!(CheckType::Icmp.as_str(), "ICMP");
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("192.0.2.1", 80), "192.0.2.1:80");
        assert_eq!(format_host_port("2001:db8::1", 80), "[2001:db8::1]:80");
        assert_eq!(format_host_port("example.lan", 8080), "example.lan:8080");
    }

    #[test]
    fn test_unknown_target_is_healthy() {
        let service = service();
        assert!(service.is_healthy("192.0.2.99"));
    }

    #[tokio::test]
    async fn test_tcp_check_against_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let service = service();
        service.add_check(
            "live-backend",
            HealthCheck::tcp(
                "127.0.0.1",
                addr.port(),
                Duration::from_secs(30),
                Duration::from_millis(500),
            ),
        );

        wait_for(|| {
            service
                .result("live-backend")
                .is_some_and(|r| r.message.contains("successful"))
        })
        .await;
        assert!(service.is_healthy("live-backend"));
        service.stop();
    }

    #[tokio::test]
    async fn test_tcp_check_against_dead_port() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let service = service();
        service.add_check(
            "dead-backend",
            HealthCheck::tcp(
                "127.0.0.1",
                addr.port(),
                Duration::from_secs(30),
                Duration::from_millis(500),
            ),
        );

        wait_for(|| service.result("dead-backend").is_some_and(|r| !r.healthy)).await;
        assert!(!service.is_healthy("dead-backend"));
        service.stop();
    }

    #[tokio::test]
    async fn test_counts_and_remove() {
        let service = service();
        service.add_check(
            "t1",
            HealthCheck::tcp("127.0.0.1", 1, Duration::from_secs(60), Duration::from_millis(100)),
        );
        service.add_check(
            "t2",
            HealthCheck::tcp("127.0.0.1", 1, Duration::from_secs(60), Duration::from_millis(100)),
        );
        assert_eq!(service.counts().0, 2);

        service.remove_check("t1");
        assert_eq!(service.counts().0, 1);
        assert!(service.result("t1").is_none());
        service.stop();
    }

    #[tokio::test]
    async fn test_all_results() {
        let service = service();
        service.add_check(
            "t1",
            HealthCheck::tcp("127.0.0.1", 1, Duration::from_secs(60), Duration::from_millis(100)),
        );
        let results = service.all_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].target, "t1");
        service.stop();
    }
}
