//! Key/value store access.
//!
//! The store holds everything persisted by the server: zone documents, the
//! zone index, allow-list and upstream configuration, and the query-stat
//! counters. Only four operations matter to this crate: GET, SET (no
//! expiry), DEL, and SCAN MATCH COUNT 100.
//!
//! # Backends
//!
//! - [`ValkeyStore`]: the production backend over a Valkey/Redis-wire
//!   server, with per-call timeouts and exponential-backoff retries.
//! - [`MemoryStore`]: an in-process map used by tests and development.
//!
//! Components take `Arc<dyn KeyValueStore>` so the backend is swappable at
//! construction time; there is no process-wide client.

mod memory;
mod valkey;

pub use memory::MemoryStore;
pub use valkey::{ValkeyOptions, ValkeyStore};

use async_trait::async_trait;
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist. This is the normal miss, not a failure.
    #[error("key not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// The store could not be reached, or gave up after retries.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Description of the outage.
        reason: String,
    },

    /// A stored value could not be decoded.
    #[error("store value encoding error: {reason}")]
    Encoding {
        /// Description of the decode failure.
        reason: String,
    },
}

impl StoreError {
    /// Create a not-found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Create an encoding error.
    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding {
            reason: reason.into(),
        }
    }

    /// Whether this is a plain miss.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Type alias for Result with [`StoreError`].
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The four store operations this crate depends on, plus a liveness probe.
///
/// All values are UTF-8 strings; callers layer JSON (or decimal counters)
/// on top. Implementations must be safe for concurrent use.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value at `key`. Missing keys are [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> StoreResult<String>;

    /// Store `value` at `key` with no expiry, overwriting any prior value.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List keys matching `pattern` (glob syntax, e.g. `record:example.lan.:*`).
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Round-trip a trivial command to verify the store is reachable.
    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(StoreError::not_found("zone:x.").is_not_found());
        assert!(!StoreError::unavailable("down").is_not_found());
        assert!(!StoreError::encoding("bad json").is_not_found());
    }

    #[test]
    fn test_display() {
        let err = StoreError::not_found("zones:list");
        assert!(err.to_string().contains("zones:list"));

        let err = StoreError::unavailable("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }
}
