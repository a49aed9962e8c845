//! valdns: authoritative and forwarding DNS server backed by a
//! Valkey-compatible key/value store.
//!
//! Zones and records live in the shared store so any number of instances
//! answer from the same data; per-instance state (cache, rate limiter
//! buckets, backend groups, health results, the query log buffer) is
//! rebuilt from the store and from traffic.
//!
//! # Architecture
//!
//! ```text
//! UDP/TCP :53
//!     │
//!     ▼
//! ┌──────────────┐
//! │  DnsHandler  │── rate limit ──▶ REFUSED
//! └──────┬───────┘
//!        ├── cache ──────────────▶ cached response
//!        ├── zone lookup ────────▶ authoritative answer (LB may pick one)
//!        ├── allow-list+forward ─▶ upstream response
//!        └── otherwise ──────────▶ NXDOMAIN
//!
//! Valkey: zone:<domain> · zones:list · record:<d>:<n>:<t>
//!         dns:config:{allowedlans,upstream} · dns:stats:*
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration loading and validation
//! - [`store`]: the KV contract plus Valkey and in-memory backends
//! - [`zone`]: record/zone model and the repository
//! - [`allowlist`]: CIDR gate for the forwarding path
//! - [`upstream`]: single-upstream forwarder with TCP fallback
//! - [`cache`]: TTL+LRU response cache
//! - [`lb`]: backend selection strategies
//! - [`health`]: active TCP/HTTP probing
//! - [`querylog`]: ring-buffered query log with persisted counters
//! - [`metrics`]: the `godns_*` metric surface
//! - [`probes`]: liveness/readiness endpoints
//! - [`seed`]: first-boot store seeding
//! - [`server`]: listeners and the query pipeline

pub mod allowlist;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod lb;
pub mod metrics;
pub mod probes;
pub mod querylog;
pub mod seed;
pub mod server;
pub mod store;
pub mod upstream;
pub mod zone;

pub use config::Config;
pub use error::{DnsError, DnsResult};

/// Crate version, for the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
