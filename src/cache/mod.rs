// Resource cache
//
// Keyed map of decoded payloads with per-entry TTL. Keys are exactly
// `alias:remoteUri`; every caller builds them through `cache_key` so reads,
// refreshes, and detach invalidation all agree. Parquet payloads are never
// stored: their backing file is consumed by the materialiser. Eviction is
// lazy on read, plus an oldest-first sweep when the entry cap is reached.

use crate::protocol::ResourcePayload;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Build the canonical cache key for a resolved reference.
pub fn cache_key(alias: &str, remote_uri: &str) -> String {
    format!("{}:{}", alias, remote_uri)
}

/// Prefix covering every key of one alias.
pub fn alias_prefix(alias: &str) -> String {
    format!("{}:", alias)
}

struct CacheEntry {
    payload: ResourcePayload,
    inserted: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted.elapsed() > self.ttl
    }
}

/// Cache snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
    pub entries: usize,
}

/// TTL cache of decoded resource payloads.
pub struct ResourceCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    enabled: bool,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourceCache {
    pub fn new(enabled: bool, max_entries: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enabled,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a payload if present and within TTL. Expired entries are removed.
    pub fn get_fresh(&self, key: &str) -> Option<ResourcePayload> {
        if !self.enabled {
            return None;
        }
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }
        // Expired: evict under the write lock.
        self.entries.write().remove(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a payload. Uncacheable payloads (Parquet files) are ignored.
    pub fn put(&self, key: &str, payload: ResourcePayload, ttl: Duration) {
        if !self.enabled || !payload.cacheable() {
            return;
        }
        let mut entries = self.entries.write();
        if let Some(cap) = self.max_entries {
            while entries.len() >= cap && !entries.contains_key(key) {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    /// Whether a fresh entry exists, without touching the hit/miss
    /// counters. Used by query analysis.
    pub fn contains_fresh(&self, key: &str) -> bool {
        self.entries
            .read()
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Remove one entry.
    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries currently stored (including not-yet-swept expired
    /// ones).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let accesses = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate_pct: if accesses == 0 {
                0.0
            } else {
                hits as f64 * 100.0 / accesses as f64
            },
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Row;

    fn rows_payload(n: usize) -> ResourcePayload {
        let rows = (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), serde_json::Value::from(i as u64));
                row
            })
            .collect();
        ResourcePayload::Rows(rows)
    }

    #[test]
    fn test_put_then_get_within_ttl() {
        let cache = ResourceCache::new(true, None);
        let key = cache_key("github", "issues.json");
        cache.put(&key, rows_payload(2), Duration::from_secs(60));
        let payload = cache.get_fresh(&key).expect("fresh entry");
        assert_eq!(payload.row_count(), Some(2));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expired_entry_is_evicted() {
        let cache = ResourceCache::new(true, None);
        let key = cache_key("a", "r");
        cache.put(&key, rows_payload(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_fresh(&key).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = ResourceCache::new(true, None);
        let key = cache_key("a", "r");
        cache.put(&key, rows_payload(1), Duration::from_secs(60));
        cache.invalidate(&key);
        assert!(cache.get_fresh(&key).is_none());
    }

    #[test]
    fn test_invalidate_prefix_only_hits_alias() {
        let cache = ResourceCache::new(true, None);
        cache.put(&cache_key("a", "one"), rows_payload(1), Duration::from_secs(60));
        cache.put(&cache_key("a", "two"), rows_payload(1), Duration::from_secs(60));
        cache.put(&cache_key("ab", "one"), rows_payload(1), Duration::from_secs(60));

        let removed = cache.invalidate_prefix(&alias_prefix("a"));
        assert_eq!(removed, 2);
        assert!(cache.get_fresh(&cache_key("ab", "one")).is_some());
    }

    #[test]
    fn test_parquet_is_never_stored() {
        let cache = ResourceCache::new(true, None);
        let key = cache_key("a", "data.parquet");
        cache.put(
            &key,
            ResourcePayload::ParquetFile(std::path::PathBuf::from("/tmp/x.parquet")),
            Duration::from_secs(60),
        );
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = ResourceCache::new(false, None);
        let key = cache_key("a", "r");
        cache.put(&key, rows_payload(1), Duration::from_secs(60));
        assert!(cache.get_fresh(&key).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_cap_evicts_oldest_first() {
        let cache = ResourceCache::new(true, Some(2));
        cache.put(&cache_key("a", "first"), rows_payload(1), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(&cache_key("a", "second"), rows_payload(1), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(&cache_key("a", "third"), rows_payload(1), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_fresh(&cache_key("a", "first")).is_none());
        assert!(cache.get_fresh(&cache_key("a", "third")).is_some());
    }
}
