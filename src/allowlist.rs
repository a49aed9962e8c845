//! Source-address allow-list for the forwarding path.
//!
//! Queries for names outside every local zone are only forwarded upstream
//! when the client's source address falls inside one of these prefixes
//! (or when the check is disabled in configuration). The prefixes live in
//! the KV store under `dns:config:allowedlans` as
//! `{"prefixes": ["10.0.0.0/8", "fd00::/8", ...]}` and are loaded once at
//! startup; `reload` re-reads the key on demand.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{KeyValueStore, StoreResult};

/// Store key holding the allow-list document.
pub const ALLOWED_LANS_KEY: &str = "dns:config:allowedlans";

/// The persisted allow-list document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedLansConfig {
    /// CIDR prefixes, IPv4 and IPv6 mixed.
    pub prefixes: Vec<String>,
}

/// An ordered set of CIDR prefixes with a contains-check.
pub struct AllowedLans {
    store: Arc<dyn KeyValueStore>,
    prefixes: RwLock<Vec<IpNet>>,
}

impl AllowedLans {
    /// Create an empty allow-list bound to `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            prefixes: RwLock::new(Vec::new()),
        }
    }

    /// Load prefixes from the store, replacing the in-memory set.
    ///
    /// Unparseable prefixes are skipped with a warning; a missing key
    /// leaves the set empty.
    pub async fn reload(&self) -> StoreResult<usize> {
        let data = match self.store.get(ALLOWED_LANS_KEY).await {
            Ok(data) => data,
            Err(err) if err.is_not_found() => {
                *self.prefixes.write() = Vec::new();
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        let config: AllowedLansConfig = serde_json::from_str(&data).map_err(|e| {
            crate::store::StoreError::encoding(format!("allowed LANs document: {e}"))
        })?;

        let mut parsed = Vec::with_capacity(config.prefixes.len());
        for prefix in &config.prefixes {
            match prefix.parse::<IpNet>() {
                Ok(net) => parsed.push(net),
                Err(err) => {
                    warn!(prefix = %prefix, error = %err, "skipping invalid allow-list prefix");
                }
            }
        }

        let count = parsed.len();
        *self.prefixes.write() = parsed;
        info!(prefixes = count, "loaded allowed LAN prefixes");
        Ok(count)
    }

    /// Seed `defaults` into the store when the key is absent, then load.
    /// Safe to run from several instances at once: the write only happens
    /// on a miss, and concurrent writers write identical content.
    pub async fn seed_defaults(&self, defaults: &[&str]) -> StoreResult<usize> {
        match self.store.get(ALLOWED_LANS_KEY).await {
            Ok(_) => return self.reload().await,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let config = AllowedLansConfig {
            prefixes: defaults.iter().map(|p| (*p).to_string()).collect(),
        };
        let data = serde_json::to_string(&config).map_err(|e| {
            crate::store::StoreError::encoding(format!("allowed LANs document: {e}"))
        })?;
        self.store.set(ALLOWED_LANS_KEY, &data).await?;
        info!(prefixes = defaults.len(), "seeded default allowed LANs");

        self.reload().await
    }

    /// Whether `addr` is inside any allowed prefix.
    ///
    /// IPv4-mapped IPv6 addresses are unmapped first so clients arriving
    /// over a dual-stack socket match their IPv4 prefixes.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = unmap(addr);
        self.prefixes.read().iter().any(|net| net.contains(&addr))
    }

    /// Number of loaded prefixes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.read().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.read().is_empty()
    }

    /// The current prefixes, for diagnostics.
    #[must_use]
    pub fn prefixes(&self) -> Vec<IpNet> {
        self.prefixes.read().clone()
    }
}

/// Convert an IPv4-mapped IPv6 address to its IPv4 form.
#[must_use]
pub fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}
