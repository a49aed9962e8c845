//! Zone storage over the KV store.
//!
//! Key layout:
//!
//! - `zone:<domain>`: JSON zone document, the source of truth
//! - `zones:list`: JSON array of zone domains, for enumeration without SCAN
//! - `record:<domain>:<name>:<type>`: denormalised single-record documents,
//!   rebuilt from the zone document on every zone write; the read path in
//!   this module never consults them
//!
//! Lookup semantics live in [`ZoneRepository::lookup_record`]: disabled
//! records and zones are invisible, a CNAME at the queried name answers
//! A/AAAA queries, ALIAS records are flattened within the zone, and a
//! `*.<parent>` wildcard matches only when the exact name yields nothing.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::store::{KeyValueStore, StoreError, StoreResult};

use super::{fqdn, Record, RecordType, Zone, ZoneError};

const ZONE_KEY_PREFIX: &str = "zone:";
const ZONE_LIST_KEY: &str = "zones:list";
const RECORD_KEY_PREFIX: &str = "record:";

/// Zone and record access over an abstract KV store.
///
/// Cloneable and cheap to share; all state lives in the store.
#[derive(Clone)]
pub struct ZoneRepository {
    store: Arc<dyn KeyValueStore>,
}

impl ZoneRepository {
    /// Create a repository over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn zone_key(domain: &str) -> String {
        format!("{ZONE_KEY_PREFIX}{domain}")
    }

    fn record_key(domain: &str, name: &str, rtype: RecordType) -> String {
        format!("{RECORD_KEY_PREFIX}{domain}:{name}:{rtype}")
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetch one zone by domain.
    pub async fn get_zone(&self, domain: &str) -> StoreResult<Zone> {
        let domain = fqdn(domain);
        let data = self.store.get(&Self::zone_key(&domain)).await?;
        serde_json::from_str(&data)
            .map_err(|e| StoreError::encoding(format!("zone {domain}: {e}")))
    }

    /// Suffix-walk `name` from most to least specific and return the
    /// domain of the covering zone, if any.
    pub async fn has_zone_for(&self, name: &str) -> StoreResult<Option<String>> {
        Ok(self.find_zone(name).await?.map(|zone| zone.domain))
    }

    /// Suffix-walk `name` and return the covering zone document.
    ///
    /// A missing key at one suffix moves on to the next; a store outage
    /// propagates so the caller can fall through to the forwarding branch.
    pub async fn find_zone(&self, name: &str) -> StoreResult<Option<Zone>> {
        let name = fqdn(name);
        let labels: Vec<&str> = name.trim_end_matches('.').split('.').collect();

        for i in 0..labels.len() {
            let domain = format!("{}.", labels[i..].join("."));
            match self.get_zone(&domain).await {
                Ok(zone) => {
                    debug!(name = %name, zone = %zone.domain, "suffix walk matched zone");
                    return Ok(Some(zone));
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    warn!(name = %name, suffix = %domain, error = %err, "zone probe failed");
                    return Err(err);
                }
            }
        }

        Ok(None)
    }

    /// All known zone domains, from the `zones:list` index.
    pub async fn list_zones(&self) -> StoreResult<Vec<String>> {
        match self.store.get(ZONE_LIST_KEY).await {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| StoreError::encoding(format!("zone list: {e}"))),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Denormalised point lookup of one record document.
    ///
    /// This is the fast path kept for external consumers; it must not be
    /// trusted over the zone document when the two disagree.
    pub async fn get_record(
        &self,
        domain: &str,
        name: &str,
        rtype: RecordType,
    ) -> StoreResult<Record> {
        let key = Self::record_key(&fqdn(domain), &fqdn(name), rtype);
        let data = self.store.get(&key).await?;
        serde_json::from_str(&data).map_err(|e| StoreError::encoding(format!("{key}: {e}")))
    }

    /// Records answering (`name`, `qtype`) within `zone`.
    ///
    /// Resolution order:
    ///
    /// 1. disabled zone → nothing;
    /// 2. CNAME at the exact name answers A/AAAA queries;
    /// 3. exact-name records of the queried type;
    /// 4. ALIAS at the exact name, flattened to in-zone address records;
    /// 5. wildcard `*.<parent>`, with the same CNAME-before-type order,
    ///    owner names rewritten to the queried name.
    ///
    /// Disabled records are treated as absent throughout.
    #[must_use]
    pub fn lookup_record(&self, zone: &Zone, name: &str, qtype: RecordType) -> Vec<Record> {
        if !zone.enabled {
            return Vec::new();
        }

        let name = fqdn(name);
        let exact: Vec<&Record> = zone
            .records
            .iter()
            .filter(|r| !r.disabled && r.name == name)
            .collect();

        if let Some(records) = Self::match_at(&exact, &name, qtype, zone) {
            return records;
        }

        // Wildcard: single-label substitution, only when the exact name
        // produced nothing for this type.
        let Some((_, parent)) = name.split_once('.') else {
            return Vec::new();
        };
        if parent.is_empty() {
            return Vec::new();
        }
        let wildcard = format!("*.{parent}");
        let wild: Vec<&Record> = zone
            .records
            .iter()
            .filter(|r| !r.disabled && r.name == wildcard)
            .collect();

        match Self::match_at(&wild, &name, qtype, zone) {
            Some(records) => records
                .into_iter()
                .map(|r| r.with_name(&name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every enabled record at `name`, for ANY queries.
    #[must_use]
    pub fn lookup_any(&self, zone: &Zone, name: &str) -> Vec<Record> {
        if !zone.enabled {
            return Vec::new();
        }
        let name = fqdn(name);
        zone.records
            .iter()
            .filter(|r| !r.disabled && r.name == name)
            .cloned()
            .collect()
    }

    /// Apply the CNAME / exact-type / ALIAS order to the candidate set at
    /// one owner name. `None` means nothing matched and the caller may try
    /// the wildcard.
    fn match_at(
        candidates: &[&Record],
        qname: &str,
        qtype: RecordType,
        zone: &Zone,
    ) -> Option<Vec<Record>> {
        if qtype.is_address() {
            if let Some(cname) = candidates.iter().find(|r| r.rtype == RecordType::Cname) {
                return Some(vec![cname.with_name(qname)]);
            }
        }

        let typed: Vec<Record> = candidates
            .iter()
            .filter(|r| r.rtype == qtype)
            .map(|r| (*r).clone())
            .collect();
        if !typed.is_empty() {
            return Some(typed);
        }

        if qtype.is_address() {
            if let Some(alias) = candidates.iter().find(|r| r.rtype == RecordType::Alias) {
                let flattened = Self::flatten_alias(alias, qname, qtype, zone);
                if !flattened.is_empty() {
                    return Some(flattened);
                }
            }
        }

        None
    }

    /// Resolve an ALIAS to the target's in-zone address records, rewriting
    /// owner names to the queried name. Cross-zone targets yield nothing.
    fn flatten_alias(alias: &Record, qname: &str, qtype: RecordType, zone: &Zone) -> Vec<Record> {
        let Some(target) = alias.value() else {
            return Vec::new();
        };
        let target = fqdn(target);

        zone.records
            .iter()
            .filter(|r| !r.disabled && r.name == target && r.rtype == qtype)
            .map(|r| {
                let mut out = r.with_name(qname);
                out.ttl = out.ttl.min(alias.ttl);
                out
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutations (API and seeder paths)
    // ------------------------------------------------------------------

    /// Create a zone that does not exist yet.
    pub async fn create_zone(&self, zone: &Zone) -> StoreResult<()> {
        zone.validate().map_err(zone_encoding_error)?;

        match self.store.get(&Self::zone_key(&zone.domain)).await {
            Ok(_) => {
                return Err(StoreError::encoding(format!(
                    "zone {} already exists",
                    zone.domain
                )))
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        self.put_zone(zone).await
    }

    /// Write a zone document, refresh the zone index, and rebuild the
    /// zone's denormalised record keys from the new document.
    pub async fn put_zone(&self, zone: &Zone) -> StoreResult<()> {
        zone.validate().map_err(zone_encoding_error)?;

        let data = serde_json::to_string(zone)
            .map_err(|e| StoreError::encoding(format!("zone {}: {e}", zone.domain)))?;
        self.store.set(&Self::zone_key(&zone.domain), &data).await?;

        let mut zones = self.list_zones().await?;
        if !zones.contains(&zone.domain) {
            zones.push(zone.domain.clone());
            let list = serde_json::to_string(&zones)
                .map_err(|e| StoreError::encoding(format!("zone list: {e}")))?;
            self.store.set(ZONE_LIST_KEY, &list).await?;
        }

        self.rebuild_record_keys(zone).await
    }

    /// Delete a zone, its index entry, and its record keys.
    pub async fn delete_zone(&self, domain: &str) -> StoreResult<()> {
        let domain = fqdn(domain);
        self.store.delete(&Self::zone_key(&domain)).await?;

        let zones: Vec<String> = self
            .list_zones()
            .await?
            .into_iter()
            .filter(|z| *z != domain)
            .collect();
        let list = serde_json::to_string(&zones)
            .map_err(|e| StoreError::encoding(format!("zone list: {e}")))?;
        self.store.set(ZONE_LIST_KEY, &list).await?;

        self.delete_record_keys(&domain).await
    }

    /// Drop and rewrite `record:<domain>:*` from the zone document. The
    /// zone document stays authoritative; a crash between the two writes
    /// only leaves the fast path stale, never the lookup path.
    async fn rebuild_record_keys(&self, zone: &Zone) -> StoreResult<()> {
        self.delete_record_keys(&zone.domain).await?;

        let mut written = std::collections::HashSet::new();
        for record in &zone.records {
            // One document per (name, type); the first record wins when a
            // record set has several members.
            if !written.insert((record.name.clone(), record.rtype)) {
                continue;
            }
            let key = Self::record_key(&zone.domain, &record.name, record.rtype);
            let data = serde_json::to_string(record)
                .map_err(|e| StoreError::encoding(format!("{key}: {e}")))?;
            self.store.set(&key, &data).await?;
        }
        Ok(())
    }

    async fn delete_record_keys(&self, domain: &str) -> StoreResult<()> {
        let keys = self
            .store
            .scan(&format!("{RECORD_KEY_PREFIX}{domain}:*"))
            .await?;
        for key in keys {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

fn zone_encoding_error(err: ZoneError) -> StoreError {
    StoreError::encoding(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn repo() -> ZoneRepository {
        ZoneRepository::new(Arc::new(MemoryStore::new()))
    }

    fn sample_zone() -> Zone {
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
                Record::a("www.example.lan.", "192.0.2.10", 300),
                Record::aaaa("www.example.lan.", "2001:db8::10", 300),
                Record::cname("web.example.lan.", "www.example.lan.", 300),
                Record::alias("example.lan.", "www.example.lan.", 120),
                Record::a("*.svc.example.lan.", "10.1.2.3", 300),
                Record::cname("api.svc.example.lan.", "backend.example.lan.", 300),
                Record::a("backend.example.lan.", "192.0.2.20", 300),
                Record::a("off.example.lan.", "192.0.2.99", 300).disabled(),
            ],
        )
    }

    // ========================================================================
    // Persistence round trip
    // ========================================================================

    #[tokio::test]
    async fn test_create_and_get_zone() {
        let repo = repo();
        let zone = sample_zone();

        repo.create_zone(&zone).await.unwrap();

        let loaded = repo.get_zone("example.lan.").await.unwrap();
        assert_eq!(loaded.domain, "example.lan.");
        assert_eq!(loaded.records.len(), zone.records.len());
        assert!(loaded.enabled);
    }

    #[tokio::test]
    async fn test_create_existing_zone_fails() {
        let repo = repo();
        let zone = sample_zone();

        repo.create_zone(&zone).await.unwrap();
        assert!(repo.create_zone(&zone).await.is_err());
    }

    #[tokio::test]
    async fn test_zone_list_index() {
        let repo = repo();
        repo.create_zone(&sample_zone()).await.unwrap();
        repo.create_zone(&Zone::new("home.lan.", vec![])).await.unwrap();

        let mut zones = repo.list_zones().await.unwrap();
        zones.sort();
        assert_eq!(zones, vec!["example.lan.", "home.lan."]);

        repo.delete_zone("home.lan.").await.unwrap();
        assert_eq!(repo.list_zones().await.unwrap(), vec!["example.lan."]);
    }

    #[tokio::test]
    async fn test_record_keys_rebuilt_on_write() {
        let store = Arc::new(MemoryStore::new());
        let repo = ZoneRepository::new(store.clone());

        repo.create_zone(&sample_zone()).await.unwrap();
        let keys = store.scan("record:example.lan.:*").await.unwrap();
        assert!(keys.contains(&"record:example.lan.:www.example.lan.:A".to_string()));

        // Shrink the zone; stale keys must disappear.
        let small = Zone::new(
            "example.lan.",
            vec![Record::a("www.example.lan.", "192.0.2.10", 300)],
        );
        repo.put_zone(&small).await.unwrap();
        let keys = store.scan("record:example.lan.:*").await.unwrap();
        assert_eq!(keys, vec!["record:example.lan.:www.example.lan.:A"]);
    }

    #[tokio::test]
    async fn test_get_record_fast_path() {
        let repo = repo();
        repo.create_zone(&sample_zone()).await.unwrap();

        let record = repo
            .get_record("example.lan.", "www.example.lan.", RecordType::A)
            .await
            .unwrap();
        assert_eq!(record.value(), Some("192.0.2.10"));
    }

    // ========================================================================
    // Suffix walk
    // ========================================================================

    #[tokio::test]
    async fn test_suffix_walk_finds_zone() {
        let repo = repo();
        repo.create_zone(&sample_zone()).await.unwrap();

        assert_eq!(
            repo.has_zone_for("www.example.lan.").await.unwrap(),
            Some("example.lan.".to_string())
        );
        assert_eq!(
            repo.has_zone_for("deep.sub.example.lan.").await.unwrap(),
            Some("example.lan.".to_string())
        );
        assert_eq!(
            repo.has_zone_for("example.lan.").await.unwrap(),
            Some("example.lan.".to_string())
        );
        assert_eq!(repo.has_zone_for("example.com.").await.unwrap(), None);
    }

    // ========================================================================
    // Lookup semantics
    // ========================================================================

    #[tokio::test]
    async fn test_lookup_exact_a() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "www.example.lan.", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(), Some("192.0.2.10"));
    }

    #[tokio::test]
    async fn test_lookup_case_insensitive() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "WWW.Example.LAN.", RecordType::A);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_cname_answers_address_query() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "web.example.lan.", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rtype, RecordType::Cname);
    }

    #[tokio::test]
    async fn test_lookup_disabled_record_absent() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "off.example.lan.", RecordType::A);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_disabled_zone_empty() {
        let repo = repo();
        let mut zone = sample_zone();
        zone.enabled = false;

        let records = repo.lookup_record(&zone, "www.example.lan.", RecordType::A);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_match_rewrites_name() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "anything.svc.example.lan.", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "anything.svc.example.lan.");
        assert_eq!(records[0].value(), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_cname_at_exact_name_preempts_wildcard() {
        let repo = repo();
        let zone = sample_zone();

        // api.svc.example.lan. has a CNAME; *.svc.example.lan. has an A.
        let records = repo.lookup_record(&zone, "api.svc.example.lan.", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rtype, RecordType::Cname);
        assert_eq!(records[0].value(), Some("backend.example.lan."));
    }

    #[tokio::test]
    async fn test_wildcard_single_level_only() {
        let repo = repo();
        let zone = sample_zone();

        // The wildcard owner is *.svc.example.lan.; a name one label deeper
        // substitutes only its first label, so it does not match.
        let records = repo.lookup_record(&zone, "a.b.svc.example.lan.", RecordType::A);
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_alias_flattens_at_apex() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "example.lan.", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "example.lan.");
        assert_eq!(records[0].value(), Some("192.0.2.10"));
        // TTL is capped by the ALIAS record's own TTL.
        assert_eq!(records[0].ttl, 120);
    }

    #[tokio::test]
    async fn test_lookup_any() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_any(&zone, "www.example.lan.");
        assert_eq!(records.len(), 2); // A + AAAA
    }

    #[tokio::test]
    async fn test_lookup_missing_type_empty() {
        let repo = repo();
        let zone = sample_zone();

        let records = repo.lookup_record(&zone, "www.example.lan.", RecordType::Mx);
        assert!(records.is_empty());
    }
}
