//! Startup seeding.
//!
//! On boot, the seeder makes sure the store holds an allow-list document
//! and an upstream document, writing the configured defaults when a key
//! is absent and loading it otherwise. In development mode it also writes
//! a set of sample zones the first time (skipped as soon as any zone
//! exists), so a fresh instance answers real queries immediately.
//!
//! Seeding is idempotent and safe to run concurrently from several
//! instances: each write happens only on a miss, and concurrent writers
//! write identical content.

use std::sync::Arc;

use tracing::{info, warn};

use crate::allowlist::AllowedLans;
use crate::store::StoreResult;
use crate::upstream::UpstreamForwarder;
use crate::zone::{Record, Zone, ZoneRepository};

/// Default allow-list written on first boot: RFC 1918 + ULA + loopback.
pub const DEFAULT_ALLOWED_PREFIXES: [&str; 6] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "fd00::/8",
    "127.0.0.0/8",
    "::1/128",
];

/// Seeds configuration and (in development) sample zones.
pub struct Seeder {
    allowed_lans: Arc<AllowedLans>,
    upstream: Arc<UpstreamForwarder>,
    repository: ZoneRepository,
}

impl Seeder {
    /// Create a seeder over the shared components.
    pub fn new(
        allowed_lans: Arc<AllowedLans>,
        upstream: Arc<UpstreamForwarder>,
        repository: ZoneRepository,
    ) -> Self {
        Self {
            allowed_lans,
            upstream,
            repository,
        }
    }

    /// Seed everything. `default_upstream` comes from configuration;
    /// `development` gates the sample zones. Store failures here are
    /// returned to the caller and are fatal at startup.
    pub async fn seed(&self, default_upstream: &str, development: bool) -> StoreResult<()> {
        info!("starting configuration seeding");

        self.allowed_lans
            .seed_defaults(&DEFAULT_ALLOWED_PREFIXES)
            .await?;
        self.upstream.seed_default(default_upstream).await?;

        if development {
            info!("development mode, seeding sample zones");
            if let Err(err) = self.seed_sample_zones().await {
                // Sample data is a convenience; a failure here must not
                // take the instance down.
                warn!(error = %err, "failed to seed sample zones");
            }
        }

        info!("configuration seeding completed");
        Ok(())
    }

    async fn seed_sample_zones(&self) -> StoreResult<()> {
        let existing = self.repository.list_zones().await?;
        if !existing.is_empty() {
            info!(zones = existing.len(), "zones already exist, skipping sample data");
            return Ok(());
        }

        for zone in sample_zones() {
            self.repository.create_zone(&zone).await?;
            info!(zone = %zone.domain, records = zone.records.len(), "seeded sample zone");
        }

        Ok(())
    }
}

/// The sample zones written in development mode.
#[must_use]
pub fn sample_zones() -> Vec<Zone> {
    vec![
        Zone::new(
            "home.lan.",
            vec![
                Record::soa(
                    "home.lan.",
                    "ns1.home.lan.",
                    "hostmaster.home.lan.",
                    2024110601,
                    3600,
                    1800,
                    604800,
                    300,
                    3600,
                ),
                Record::ns("home.lan.", "ns1.home.lan.", 3600),
                Record::a("ns1.home.lan.", "192.168.1.1", 3600),
                Record::a("router.home.lan.", "192.168.1.1", 300),
                Record::a("nas.home.lan.", "192.168.1.10", 300),
                Record::aaaa("nas.home.lan.", "fd00::10", 300),
                Record::a("server.home.lan.", "192.168.1.100", 300),
                Record::cname("www.home.lan.", "server.home.lan.", 300),
                Record::txt("home.lan.", "v=spf1 ip4:192.168.1.0/24 -all", 300),
            ],
        ),
        Zone::new(
            "dev.local.",
            vec![
                Record::soa(
                    "dev.local.",
                    "ns.dev.local.",
                    "hostmaster.dev.local.",
                    2024110601,
                    3600,
                    1800,
                    604800,
                    300,
                    3600,
                ),
                Record::ns("dev.local.", "ns.dev.local.", 3600),
                Record::a("ns.dev.local.", "127.0.0.1", 3600),
                Record::a("api.dev.local.", "127.0.0.1", 300),
                Record::a("web.dev.local.", "127.0.0.1", 300),
                Record::mx("dev.local.", 10, "mail.dev.local.", 300),
                Record::a("mail.dev.local.", "127.0.0.1", 300),
                Record::cname("www.dev.local.", "web.dev.local.", 300),
                Record::srv("_http._tcp.dev.local.", 10, 60, 80, "web.dev.local.", 300),
                Record::txt("dev.local.", "v=spf1 ip4:127.0.0.1 -all", 300),
            ],
        ),
        Zone::new(
            "k8s.local.",
            vec![
                Record::soa(
                    "k8s.local.",
                    "ns.k8s.local.",
                    "hostmaster.k8s.local.",
                    2024110601,
                    3600,
                    1800,
                    604800,
                    300,
                    3600,
                ),
                Record::ns("k8s.local.", "ns.k8s.local.", 3600),
                Record::a("ns.k8s.local.", "10.0.1.1", 3600),
                Record::a("master.k8s.local.", "10.0.1.10", 300),
                Record::a("ingress.k8s.local.", "10.0.1.100", 300),
                Record::aaaa("master.k8s.local.", "fd00:10::10", 300),
                // Wildcard for everything under apps.
                Record::a("*.apps.k8s.local.", "10.0.1.100", 300),
                Record::cname("api.k8s.local.", "master.k8s.local.", 300),
                Record::srv(
                    "_etcd-server._tcp.k8s.local.",
                    10,
                    60,
                    2380,
                    "master.k8s.local.",
                    300,
                ),
            ],
        ),
        Zone::new(
            "example.lan.",
            vec![
                Record::soa(
                    "example.lan.",
                    "ns1.example.lan.",
                    "hostmaster.example.lan.",
                    2024110601,
                    3600,
                    1800,
                    604800,
                    300,
                    3600,
                ),
                Record::ns("example.lan.", "ns1.example.lan.", 3600),
                Record::a("ns1.example.lan.", "192.168.100.1", 3600),
                Record::a("www.example.lan.", "192.168.100.10", 300),
                // Apex alias; CNAME would be illegal here.
                Record::alias("example.lan.", "www.example.lan.", 300),
                Record::a("mail.example.lan.", "192.168.100.20", 300),
                Record::mx("example.lan.", 10, "mail.example.lan.", 300),
                Record::txt("example.lan.", "v=spf1 mx ip4:192.168.100.0/24 -all", 300),
                Record::caa("example.lan.", 0, "issue", "ca.example.net", 3600),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore};
    use std::time::Duration;

    fn seeder(store: Arc<MemoryStore>) -> Seeder {
        let allowed = Arc::new(AllowedLans::new(store.clone() as Arc<dyn KeyValueStore>));
        let upstream = Arc::new(UpstreamForwarder::new(
            store.clone() as Arc<dyn KeyValueStore>,
            Duration::from_secs(3),
        ));
        let repository = ZoneRepository::new(store as Arc<dyn KeyValueStore>);
        Seeder::new(allowed, upstream, repository)
    }

    #[test]
    fn test_sample_zones_are_valid() {
        for zone in sample_zones() {
            zone.validate()
                .unwrap_or_else(|e| panic!("sample zone {} invalid: {e}", zone.domain));
        }
    }

    #[tokio::test]
    async fn test_seed_writes_config_keys() {
        let store = Arc::new(MemoryStore::new());
        let seeder = seeder(store.clone());

        seeder.seed("127.0.0.1:53", false).await.unwrap();

        assert!(store.get("dns:config:allowedlans").await.is_ok());
        assert!(store.get("dns:config:upstream").await.is_ok());
        // No development mode, no zones.
        assert!(store.get("zones:list").await.is_err());
    }

    #[tokio::test]
    async fn test_seed_development_writes_zones() {
        let store = Arc::new(MemoryStore::new());
        let seeder = seeder(store.clone());

        seeder.seed("127.0.0.1:53", true).await.unwrap();

        let repository = ZoneRepository::new(store as Arc<dyn KeyValueStore>);
        let zones = repository.list_zones().await.unwrap();
        assert_eq!(zones.len(), 4);
        assert!(zones.contains(&"example.lan.".to_string()));

        let zone = repository.get_zone("k8s.local.").await.unwrap();
        assert!(zone.records.iter().any(|r| r.name.starts_with("*.")));
    }

    #[tokio::test]
    async fn test_seed_skips_existing_zones() {
        let store = Arc::new(MemoryStore::new());
        let repository = ZoneRepository::new(store.clone() as Arc<dyn KeyValueStore>);
        repository
            .create_zone(&Zone::new("mine.lan.", vec![]))
            .await
            .unwrap();

        let seeder = seeder(store.clone());
        seeder.seed("127.0.0.1:53", true).await.unwrap();

        let zones = repository.list_zones().await.unwrap();
        assert_eq!(zones, vec!["mine.lan."]);
    }

    #[tokio::test]
    async fn test_seed_idempotent() {
        let store = Arc::new(MemoryStore::new());

        seeder(store.clone()).seed("127.0.0.1:53", true).await.unwrap();
        let first = store.scan("*").await.unwrap();

        seeder(store.clone()).seed("127.0.0.1:54", true).await.unwrap();
        let second = store.scan("*").await.unwrap();

        assert_eq!(first, second);
        // The original upstream document survives.
        let upstream = store.get("dns:config:upstream").await.unwrap();
        assert!(upstream.contains("127.0.0.1:53"));
    }
}
