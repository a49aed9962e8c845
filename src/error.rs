//! Error types for the DNS data plane.
//!
//! The handler never lets an error escape: every variant here is mapped to
//! a DNS response code or a fall-through inside the pipeline. The variants
//! mirror the failure points of a query's life: parsing, the store, the
//! upstream exchange, rate limiting, and configuration.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Store errors**: KV store misses and outages (see [`crate::store::StoreError`])
//! - **Upstream errors**: forwarding failures and timeouts
//! - **Rate limit errors**: client over its token budget
//! - **Config errors**: malformed addresses or parameters at startup
//!
//! # Example
//!
//! ```
//! use valdns::error::DnsError;
//!
//! let err = DnsError::timeout("forward to 1.1.1.1:53", std::time::Duration::from_secs(3));
//! assert!(err.is_timeout());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Error type for DNS query processing.
///
/// # Response mapping
///
/// - `RateLimitExceeded` → REFUSED
/// - `UpstreamError` / `Timeout` on the forward path → NXDOMAIN for the query
/// - anything unexpected inside the pipeline → SERVFAIL
/// - `Config` → fatal at startup only
#[derive(Debug, Error)]
pub enum DnsError {
    /// A received DNS message could not be decoded.
    #[error("failed to parse DNS message: {reason}")]
    ParseError {
        /// What went wrong during parsing.
        reason: String,
    },

    /// A DNS message could not be encoded for transmission.
    #[error("failed to serialize DNS message: {reason}")]
    SerializeError {
        /// What went wrong during serialization.
        reason: String,
    },

    /// Socket-level failure.
    #[error("network error: {reason}")]
    NetworkError {
        /// Description of the failure.
        reason: String,
        /// Underlying I/O error, when available.
        #[source]
        source: Option<io::Error>,
    },

    /// An outbound call did not complete before its deadline.
    #[error("operation timed out after {timeout:?}: {context}")]
    Timeout {
        /// What timed out.
        context: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The upstream resolver failed or answered garbage.
    #[error("upstream {upstream} error: {reason}")]
    UpstreamError {
        /// Upstream address.
        upstream: String,
        /// Description of the failure.
        reason: String,
    },

    /// Client exceeded its per-source token bucket.
    #[error("rate limit exceeded for {client}")]
    RateLimitExceeded {
        /// The source address over budget.
        client: IpAddr,
    },

    /// The KV store failed in a way the caller must absorb.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration; fatal at startup.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
        /// The offending field, when known.
        field: Option<String>,
    },

    /// Unexpected condition inside the pipeline; coerced to SERVFAIL.
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the condition.
        reason: String,
    },
}

impl DnsError {
    /// Create a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error without an I/O source.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error.
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }

    /// Create a rate-limit error.
    pub fn rate_limit(client: IpAddr) -> Self {
        Self::RateLimitExceeded { client }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether this error came from the rate limiter.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error came from the upstream exchange.
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::UpstreamError { .. } | Self::Timeout { .. })
    }

    /// Whether the store reported a plain miss rather than an outage.
    #[must_use]
    pub fn is_store_miss(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::NetworkError {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for Result with [`DnsError`].
pub type DnsResult<T> = std::result::Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = DnsError::parse("short header");
        assert!(matches!(err, DnsError::ParseError { .. }));
        assert!(err.to_string().contains("short header"));
    }

    #[test]
    fn test_timeout_classification() {
        let err = DnsError::timeout("forward", Duration::from_secs(3));
        assert!(err.is_timeout());
        assert!(err.is_upstream_error());
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_rate_limit_error() {
        let client: IpAddr = "198.51.100.1".parse().unwrap();
        let err = DnsError::rate_limit(client);
        assert!(err.is_rate_limited());
        assert!(err.to_string().contains("198.51.100.1"));
    }

    #[test]
    fn test_store_miss_classification() {
        let err: DnsError = StoreError::not_found("zone:example.lan.").into();
        assert!(err.is_store_miss());

        let err: DnsError = StoreError::unavailable("connection refused").into();
        assert!(!err.is_store_miss());
    }

    #[test]
    fn test_config_field() {
        let err = DnsError::config_field("invalid listen address", "dns.server.port");
        assert!(matches!(err, DnsError::Config { field: Some(_), .. }));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: DnsError = io_err.into();
        assert!(matches!(err, DnsError::NetworkError { .. }));
    }
}
