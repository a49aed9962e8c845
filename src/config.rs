//! Server configuration.
//!
//! A nested [`Config`] value is built from defaults, optionally a JSON
//! file, and environment overrides, then passed explicitly into every
//! component constructor. Nothing reads configuration from globals.
//!
//! # Configuration Structure
//!
//! ```text
//! Config
//! ├── dns
//! │   ├── server.port
//! │   ├── enable_allowed_lans_check
//! │   ├── cache.{enabled,size,ttl_seconds}
//! │   ├── rate_limit.{enabled,queries_per_sec,burst}
//! │   ├── load_balancer.{enabled,strategy}
//! │   ├── health_check.{enabled,interval_sec,timeout_sec}
//! │   ├── query_log.{enabled,buffer_size,flush_interval_sec}
//! │   ├── upstream.{server,timeout_sec}
//! │   └── probes.{liveness_port,readiness_port}
//! ├── metrics.{enabled,port}
//! ├── valkey.{host,port,username,token,timeout_sec,max_retries,initial_retry_delay_ms}
//! └── development
//! ```
//!
//! Listen addresses accept the `:53` shorthand for "all interfaces".

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DnsError, DnsResult};
use crate::lb::Strategy;
use crate::store::ValkeyOptions;

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "VALDNS_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// DNS data-plane settings.
    #[serde(default)]
    pub dns: DnsSettings,

    /// Metrics exposition settings.
    #[serde(default)]
    pub metrics: MetricsSettings,

    /// KV store connection settings.
    #[serde(default)]
    pub valkey: ValkeyOptions,

    /// Development mode: the seeder also writes sample zones.
    #[serde(default)]
    pub development: bool,
}

/// DNS server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// When true, non-local queries require the source to be allow-listed.
    #[serde(default)]
    pub enable_allowed_lans_check: bool,

    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Load balancer settings.
    #[serde(default)]
    pub load_balancer: LoadBalancerSettings,

    /// Health checker settings.
    #[serde(default)]
    pub health_check: HealthCheckSettings,

    /// Query log settings.
    #[serde(default)]
    pub query_log: QueryLogSettings,

    /// Upstream forwarder settings.
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Probe endpoint settings.
    #[serde(default)]
    pub probes: ProbeSettings,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            enable_allowed_lans_check: false,
            cache: CacheSettings::default(),
            rate_limit: RateLimitSettings::default(),
            load_balancer: LoadBalancerSettings::default(),
            health_check: HealthCheckSettings::default(),
            query_log: QueryLogSettings::default(),
            upstream: UpstreamSettings::default(),
            probes: ProbeSettings::default(),
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// UDP+TCP listen address; `:53` means all interfaces.
    #[serde(default = "default_server_port")]
    pub port: String,
}

fn default_server_port() -> String {
    ":53".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether responses are cached.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum cached responses.
    #[serde(default = "default_cache_size")]
    pub size: u64,

    /// Default TTL; also the upper bound on answer-derived TTLs.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

fn default_cache_size() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_cache_size(),
            ttl_seconds: default_cache_ttl(),
        }
    }
}

impl CacheSettings {
    /// Default TTL as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether per-source limiting is active.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tokens added per second per source.
    #[serde(default = "default_rate")]
    pub queries_per_sec: u32,

    /// Bucket capacity per source.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_rate() -> u32 {
    100
}

fn default_burst() -> u32 {
    200
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            queries_per_sec: default_rate(),
            burst: default_burst(),
        }
    }
}

/// Load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSettings {
    /// Whether multi-record answers go through backend selection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Strategy selector; see [`Strategy`].
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_strategy(),
        }
    }
}

impl LoadBalancerSettings {
    /// Parse the configured strategy.
    pub fn parsed_strategy(&self) -> DnsResult<Strategy> {
        self.strategy
            .parse()
            .map_err(|e: String| DnsError::config_field(e, "dns.load_balancer.strategy"))
    }
}

/// Health checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    /// Whether active probing runs.
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between probes per target.
    #[serde(default = "default_health_interval")]
    pub interval_sec: u64,

    /// Per-probe deadline in seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout_sec: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: default_health_interval(),
            timeout_sec: default_health_timeout(),
        }
    }
}

impl HealthCheckSettings {
    /// Probe interval as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec.max(1))
    }

    /// Probe timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.max(1))
    }
}

/// Query log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogSettings {
    /// Whether queries are logged.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Buffered entries before a forced flush.
    #[serde(default = "default_log_buffer")]
    pub buffer_size: usize,

    /// Seconds between background flushes.
    #[serde(default = "default_log_flush")]
    pub flush_interval_sec: u64,
}

fn default_log_buffer() -> usize {
    1000
}

fn default_log_flush() -> u64 {
    60
}

impl Default for QueryLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: default_log_buffer(),
            flush_interval_sec: default_log_flush(),
        }
    }
}

impl QueryLogSettings {
    /// Flush interval as a duration.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_sec.max(1))
    }
}

/// Upstream forwarder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Default resolver, seeded into the store when the key is absent.
    #[serde(default = "default_upstream")]
    pub server: String,

    /// Per-forward timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_sec: u64,
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout() -> u64 {
    3
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            server: default_upstream(),
            timeout_sec: default_upstream_timeout(),
        }
    }
}

impl UpstreamSettings {
    /// Per-forward timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.max(1))
    }
}

/// Probe endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Liveness server address.
    #[serde(default = "default_liveness_port")]
    pub liveness_port: String,

    /// Readiness server address.
    #[serde(default = "default_readiness_port")]
    pub readiness_port: String,
}

fn default_liveness_port() -> String {
    ":14003".to_string()
}

fn default_readiness_port() -> String {
    ":14004".to_string()
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            liveness_port: default_liveness_port(),
            readiness_port: default_readiness_port(),
        }
    }
}

/// Metrics exposition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Whether the exporter listener runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exposition address.
    #[serde(default = "default_metrics_port")]
    pub port: String,
}

fn default_metrics_port() -> String {
    ":9090".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Parse a listen address, accepting the `:port` shorthand for all
/// interfaces.
pub fn parse_listen_addr(addr: &str) -> DnsResult<SocketAddr> {
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| DnsError::config(format!("invalid port in listen address {addr}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    addr.parse()
        .map_err(|_| DnsError::config(format!("invalid listen address {addr}")))
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> DnsResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            DnsError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&data).map_err(|e| {
            DnsError::config(format!("cannot parse config file {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Load configuration with environment overrides: defaults, then the
    /// file when present, then `VALDNS_*` variables on top.
    pub fn load_with_env(path: Option<&Path>) -> DnsResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load(path)?,
            _ => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `VALDNS_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        let env = |name: &str| std::env::var(format!("{ENV_PREFIX}{name}")).ok();

        if let Some(value) = env("DNS_PORT") {
            self.dns.server.port = value;
        }
        if let Some(value) = env("ENABLE_ALLOWED_LANS_CHECK") {
            self.dns.enable_allowed_lans_check = value == "true" || value == "1";
        }
        if let Some(value) = env("UPSTREAM_SERVER") {
            self.dns.upstream.server = value;
        }
        if let Some(value) = env("METRICS_PORT") {
            self.metrics.port = value;
        }
        if let Some(value) = env("VALKEY_HOST") {
            self.valkey.host = value;
        }
        if let Some(value) = env("VALKEY_PORT") {
            if let Ok(port) = value.parse() {
                self.valkey.port = port;
            }
        }
        if let Some(value) = env("VALKEY_USERNAME") {
            self.valkey.username = value;
        }
        if let Some(value) = env("VALKEY_TOKEN") {
            self.valkey.token = value;
        }
        if let Some(value) = env("DEVELOPMENT") {
            self.development = value == "true" || value == "1";
        }
    }

    /// Validate every address and parameter; any failure is fatal at
    /// startup.
    pub fn validate(&self) -> DnsResult<()> {
        parse_listen_addr(&self.dns.server.port)?;
        parse_listen_addr(&self.dns.probes.liveness_port)?;
        parse_listen_addr(&self.dns.probes.readiness_port)?;
        if self.metrics.enabled {
            parse_listen_addr(&self.metrics.port)?;
        }

        if self.dns.cache.enabled && self.dns.cache.size == 0 {
            return Err(DnsError::config_field(
                "cache size must be positive when the cache is enabled",
                "dns.cache.size",
            ));
        }

        if self.dns.rate_limit.enabled {
            if self.dns.rate_limit.queries_per_sec == 0 {
                return Err(DnsError::config_field(
                    "queries_per_sec must be positive when rate limiting is enabled",
                    "dns.rate_limit.queries_per_sec",
                ));
            }
            if self.dns.rate_limit.burst == 0 {
                return Err(DnsError::config_field(
                    "burst must be positive when rate limiting is enabled",
                    "dns.rate_limit.burst",
                ));
            }
        }

        self.dns.load_balancer.parsed_strategy()?;

        if self.dns.upstream.server.is_empty() {
            return Err(DnsError::config_field(
                "upstream server cannot be empty",
                "dns.upstream.server",
            ));
        }

        self.valkey
            .validate()
            .map_err(|e| DnsError::config_field(e.to_string(), "valkey"))?;

        Ok(())
    }

    /// The DNS listen address.
    pub fn listen_addr(&self) -> DnsResult<SocketAddr> {
        parse_listen_addr(&self.dns.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dns.server.port, ":53");
        assert!(!config.dns.enable_allowed_lans_check);
        assert!(config.dns.cache.enabled);
        assert_eq!(config.dns.cache.size, 10_000);
        assert_eq!(config.dns.cache.ttl_seconds, 300);
        assert_eq!(config.dns.rate_limit.queries_per_sec, 100);
        assert_eq!(config.dns.rate_limit.burst, 200);
        assert_eq!(config.dns.load_balancer.strategy, "round-robin");
        assert!(!config.dns.health_check.enabled);
        assert_eq!(config.dns.query_log.buffer_size, 1000);
        assert_eq!(config.dns.upstream.server, "1.1.1.1:53");
        assert_eq!(config.dns.upstream.timeout_sec, 3);
        assert_eq!(config.metrics.port, ":9090");
        assert!(!config.development);
    }

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_listen_addr_shorthand() {
        let addr = parse_listen_addr(":53").unwrap();
        assert_eq!(addr.port(), 53);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn test_parse_listen_addr_full() {
        let addr = parse_listen_addr("127.0.0.1:5353").unwrap();
        assert_eq!(addr.port(), 5353);
    }

    #[test]
    fn test_parse_listen_addr_invalid() {
        assert!(parse_listen_addr("nonsense").is_err());
        assert!(parse_listen_addr(":notaport").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cache() {
        let mut config = Config::default();
        config.dns.cache.size = 0;
        assert!(config.validate().is_err());

        config.dns.cache.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = Config::default();
        config.dns.rate_limit.queries_per_sec = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_strategy() {
        let mut config = Config::default();
        config.dns.load_balancer.strategy = "fastest".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.dns.server.port, config.dns.server.port);
        assert_eq!(parsed.dns.cache.size, config.dns.cache.size);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{"dns": {"server": {"port": ":5353"}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.dns.server.port, ":5353");
        assert_eq!(config.dns.cache.size, 10_000);
        assert!(config.dns.rate_limit.enabled);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load("/nonexistent/valdns.json").is_err());
    }

    #[test]
    fn test_load_with_env_defaults_when_no_file() {
        let config = Config::load_with_env(None).unwrap();
        assert_eq!(config.dns.server.port, ":53");
    }
}
