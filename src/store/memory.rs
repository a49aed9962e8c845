//! In-process store backend.
//!
//! Backs the same [`KeyValueStore`] contract with a concurrent map. Used
//! by the test suite and by development setups that have no Valkey to talk
//! to. Glob matching supports the `*` wildcard, which is all SCAN patterns
//! in this crate use.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{KeyValueStore, StoreError, StoreResult};

/// A [`KeyValueStore`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match `key` against a glob `pattern` where `*` spans any run of
    /// characters. Linear two-pointer match with backtracking.
    fn glob_match(pattern: &str, key: &str) -> bool {
        let p: Vec<char> = pattern.chars().collect();
        let k: Vec<char> = key.chars().collect();
        let (mut pi, mut ki) = (0usize, 0usize);
        let mut star: Option<(usize, usize)> = None;

        while ki < k.len() {
            if pi < p.len() && (p[pi] == k[ki]) {
                pi += 1;
                ki += 1;
            } else if pi < p.len() && p[pi] == '*' {
                star = Some((pi, ki));
                pi += 1;
            } else if let Some((sp, sk)) = star {
                pi = sp + 1;
                ki = sk + 1;
                star = Some((sp, sk + 1));
            } else {
                return false;
            }
        }

        while pi < p.len() && p[pi] == '*' {
            pi += 1;
        }
        pi == p.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<String> {
        self.entries
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| Self::glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new();

        assert!(store.get("a").await.is_err());

        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), "1");

        store.set("a", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), "2");

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        assert!(store.delete("missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_patterns() {
        let store = MemoryStore::new();
        store.set("zone:example.lan.", "{}").await.unwrap();
        store.set("zone:home.lan.", "{}").await.unwrap();
        store.set("record:example.lan.:www.example.lan.:A", "{}").await.unwrap();
        store.set("zones:list", "[]").await.unwrap();

        let zones = store.scan("zone:*").await.unwrap();
        assert_eq!(zones.len(), 2);

        let records = store.scan("record:example.lan.:*").await.unwrap();
        assert_eq!(records.len(), 1);

        let all = store.scan("*").await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_glob_match() {
        assert!(MemoryStore::glob_match("*", "anything"));
        assert!(MemoryStore::glob_match("zone:*", "zone:x."));
        assert!(MemoryStore::glob_match("record:*:A", "record:z.:www.z.:A"));
        assert!(!MemoryStore::glob_match("zone:*", "record:z.:www.z.:A"));
        assert!(MemoryStore::glob_match("exact", "exact"));
        assert!(!MemoryStore::glob_match("exact", "exact2"));
    }

    #[tokio::test]
    async fn test_ping() {
        assert!(MemoryStore::new().ping().await.is_ok());
    }
}
