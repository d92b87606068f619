// Metrics collector
//
// Samples accumulate in per-kind buffers and flush on a timer into
// `{YYYY-MM-DD}-{kind}.json` files, each holding one JSON array appended in
// place. Files above the size limit rotate to a timestamp-suffixed name;
// files older than the retention window are purged at startup and on
// schedule. SLO breaches log at warn level only; nothing fails.

use super::samples::{
    hit_rate_pct, CacheSample, ConnectionSample, MemorySample, QuerySample, SampleKind,
    SummarySample,
};
use super::{
    QUERY_WINDOW, SLO_AVG_QUERY_MS, SLO_CACHE_HIT_RATE_PCT, SLO_MEMORY_BYTES, SLO_MIN_ACCESSES,
    SLO_POOL_HIT_RATE_PCT, SLO_SLOW_QUERY_MS,
};
use crate::config::MetricsConfig;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Buffered metric stream with periodic persisted rollups.
pub struct MetricsCollector {
    config: MetricsConfig,
    queries: Mutex<Vec<QuerySample>>,
    memory: Mutex<Vec<MemorySample>>,
    connections: Mutex<Vec<ConnectionSample>>,
    cache: Mutex<Vec<CacheSample>>,
    recent_query_ms: Mutex<VecDeque<f64>>,
    last_pool_rate: Mutex<f64>,
    last_cache_rate: Mutex<f64>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            queries: Mutex::new(Vec::new()),
            memory: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            cache: Mutex::new(Vec::new()),
            recent_query_ms: Mutex::new(VecDeque::with_capacity(QUERY_WINDOW)),
            last_pool_rate: Mutex::new(100.0),
            last_cache_rate: Mutex::new(100.0),
            flush_task: Mutex::new(None),
        })
    }

    /// Start the periodic flush task. Purges stale files immediately.
    pub fn start(self: &Arc<Self>) {
        self.purge_stale_files();
        let collector = Arc::clone(self);
        let interval = self.config.flush_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                collector.flush();
                collector.purge_stale_files();
            }
        });
        *self.flush_task.lock() = Some(task);
    }

    /// Stop the flush task and write out whatever is buffered.
    pub fn shutdown(&self) {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        self.flush();
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record one executed query and check the query-time SLOs.
    pub fn record_query(&self, sql: &str, duration: Duration, row_count: usize) {
        let duration_ms = duration.as_secs_f64() * 1_000.0;

        if duration_ms > SLO_SLOW_QUERY_MS {
            tracing::warn!(
                duration_ms = duration_ms as u64,
                "slow query ({} ms): {}",
                duration_ms as u64,
                truncate_sql(sql)
            );
        }

        let avg = {
            let mut recent = self.recent_query_ms.lock();
            if recent.len() == QUERY_WINDOW {
                recent.pop_front();
            }
            recent.push_back(duration_ms);
            if recent.len() as u64 >= SLO_MIN_ACCESSES {
                Some(recent.iter().sum::<f64>() / recent.len() as f64)
            } else {
                None
            }
        };
        if let Some(avg) = avg {
            if avg > SLO_AVG_QUERY_MS {
                tracing::warn!(
                    avg_ms = avg as u64,
                    "average query time over recent {} queries is {:.1} ms (SLO {} ms)",
                    QUERY_WINDOW,
                    avg,
                    SLO_AVG_QUERY_MS
                );
            }
        }

        self.queries.lock().push(QuerySample {
            timestamp: Utc::now(),
            sql: truncate_sql(sql),
            duration_ms,
            row_count,
            space_id: None,
            is_simple: duration_ms < SLO_AVG_QUERY_MS,
        });
    }

    /// Sample host memory and check the memory SLO.
    pub fn record_memory(&self) {
        let Ok(info) = sys_info::mem_info() else {
            tracing::debug!("memory sampling unavailable on this host");
            return;
        };
        let heap_total = info.total * 1024;
        let heap_used = heap_total.saturating_sub(info.avail * 1024);
        let external = 0u64;

        if heap_used + external > SLO_MEMORY_BYTES {
            tracing::warn!(
                used_mb = (heap_used / (1024 * 1024)),
                "memory usage {} MiB exceeds the {} MiB SLO",
                heap_used / (1024 * 1024),
                SLO_MEMORY_BYTES / (1024 * 1024)
            );
        }

        self.memory.lock().push(MemorySample {
            timestamp: Utc::now(),
            heap_used,
            heap_total,
            external,
            total_mb: heap_total as f64 / (1024.0 * 1024.0),
        });
    }

    /// Record a connection-pool access snapshot and check the hit-rate SLO.
    pub fn record_connection(&self, total: usize, active: usize, hits: u64, misses: u64) {
        let rate = hit_rate_pct(hits, misses);
        if hits + misses >= SLO_MIN_ACCESSES && rate < SLO_POOL_HIT_RATE_PCT {
            tracing::warn!(
                hit_rate_pct = rate as u64,
                "connection pool hit rate {:.1}% below the {}% SLO",
                rate,
                SLO_POOL_HIT_RATE_PCT
            );
        }
        *self.last_pool_rate.lock() = rate;

        self.connections.lock().push(ConnectionSample {
            timestamp: Utc::now(),
            total,
            active,
            hits,
            misses,
            hit_rate_pct: rate,
        });
    }

    /// Record a resource-cache snapshot and check the hit-rate SLO.
    pub fn record_cache(&self, hits: u64, misses: u64, entries: usize) {
        let rate = hit_rate_pct(hits, misses);
        if hits + misses >= SLO_MIN_ACCESSES && rate < SLO_CACHE_HIT_RATE_PCT {
            tracing::warn!(
                hit_rate_pct = rate as u64,
                "resource cache hit rate {:.1}% below the {}% SLO",
                rate,
                SLO_CACHE_HIT_RATE_PCT
            );
        }
        *self.last_cache_rate.lock() = rate;

        self.cache.lock().push(CacheSample {
            timestamp: Utc::now(),
            total: hits + misses,
            hits,
            misses,
            hit_rate_pct: rate,
            entries,
        });
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Drain every buffer into the per-day rollup files.
    pub fn flush(&self) {
        let queries: Vec<QuerySample> = std::mem::take(&mut *self.queries.lock());
        let memory: Vec<MemorySample> = std::mem::take(&mut *self.memory.lock());
        let connections: Vec<ConnectionSample> = std::mem::take(&mut *self.connections.lock());
        let cache: Vec<CacheSample> = std::mem::take(&mut *self.cache.lock());

        if queries.is_empty() && memory.is_empty() && connections.is_empty() && cache.is_empty() {
            return;
        }

        self.append_samples(SampleKind::Queries, &queries);
        self.append_samples(SampleKind::Memory, &memory);
        self.append_samples(SampleKind::Connections, &connections);
        self.append_samples(SampleKind::Cache, &cache);

        let summary = SummarySample {
            timestamp: Utc::now(),
            query_count: queries.len(),
            avg_query_ms: if queries.is_empty() {
                0.0
            } else {
                queries.iter().map(|q| q.duration_ms).sum::<f64>() / queries.len() as f64
            },
            pool_hit_rate_pct: *self.last_pool_rate.lock(),
            cache_hit_rate_pct: *self.last_cache_rate.lock(),
        };
        self.append_samples(SampleKind::Summary, &[summary]);
    }

    fn file_path(&self, kind: SampleKind) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d");
        self.config.logs_dir.join(format!("{}-{}.json", day, kind.as_str()))
    }

    fn append_samples<T: Serialize>(&self, kind: SampleKind, samples: &[T]) {
        if samples.is_empty() {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.config.logs_dir) {
            tracing::warn!("cannot create metrics dir {:?}: {}", self.config.logs_dir, e);
            return;
        }

        let path = self.file_path(kind);
        self.rotate_if_oversized(&path);

        let mut existing: Vec<serde_json::Value> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for sample in samples {
            match serde_json::to_value(sample) {
                Ok(value) => existing.push(value),
                Err(e) => tracing::warn!("unserialisable metric sample: {}", e),
            }
        }
        match serde_json::to_vec(&existing) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!("cannot write metrics file {:?}: {}", path, e);
                }
            }
            Err(e) => tracing::warn!("cannot serialise metrics rollup: {}", e),
        }
    }

    fn rotate_if_oversized(&self, path: &PathBuf) {
        let Ok(meta) = std::fs::metadata(path) else { return };
        if meta.len() <= self.config.max_file_size {
            return;
        }
        let stamp = Utc::now().to_rfc3339().replace(':', "-");
        let rotated = path.with_extension("").to_string_lossy().to_string();
        let rotated = PathBuf::from(format!("{}-{}.json", rotated, stamp));
        if let Err(e) = std::fs::rename(path, &rotated) {
            tracing::warn!("rotation of {:?} failed: {}", path, e);
        } else {
            tracing::info!("rotated metrics file to {:?}", rotated);
        }
    }

    /// Remove rollup files older than the retention window.
    pub fn purge_stale_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.config.logs_dir) else { return };
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".json") || name.len() < 10 {
                continue;
            }
            let Ok(day) = chrono::NaiveDate::parse_from_str(&name[..10], "%Y-%m-%d") else {
                continue;
            };
            if day < cutoff.date_naive() {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!("retention purge of {} failed: {}", name, e);
                } else {
                    tracing::debug!("purged stale metrics file {}", name);
                }
            }
        }
    }
}

fn truncate_sql(sql: &str) -> String {
    const LIMIT: usize = 200;
    if sql.len() <= LIMIT {
        sql.to_string()
    } else {
        let mut end = LIMIT;
        while !sql.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sql[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(dir: &std::path::Path) -> Arc<MetricsCollector> {
        let mut config = MetricsConfig::default();
        config.logs_dir = dir.to_path_buf();
        MetricsCollector::new(config)
    }

    #[test]
    fn test_flush_writes_day_files() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = collector(dir.path());

        metrics.record_query("SELECT 1", Duration::from_millis(5), 1);
        metrics.record_connection(1, 1, 3, 1);
        metrics.record_cache(6, 4, 2);
        metrics.flush();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        for kind in ["queries", "connections", "cache", "summary"] {
            let path = dir.path().join(format!("{}-{}.json", day, kind));
            assert!(path.exists(), "missing {:?}", path);
            let parsed: Vec<serde_json::Value> =
                serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            assert!(!parsed.is_empty());
        }
    }

    #[test]
    fn test_flush_appends_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = collector(dir.path());

        metrics.record_query("SELECT 1", Duration::from_millis(5), 1);
        metrics.flush();
        metrics.record_query("SELECT 2", Duration::from_millis(5), 1);
        metrics.flush();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let path = dir.path().join(format!("{}-queries.json", day));
        let parsed: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_rotation_when_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MetricsConfig::default();
        config.logs_dir = dir.path().to_path_buf();
        config.max_file_size = 64;
        let metrics = MetricsCollector::new(config);

        for i in 0..20 {
            metrics.record_query(&format!("SELECT {}", i), Duration::from_millis(1), 1);
        }
        metrics.flush();
        metrics.record_query("SELECT again", Duration::from_millis(1), 1);
        metrics.flush();

        let rotated = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.contains("queries-") && name.ends_with(".json")
            })
            .count();
        assert_eq!(rotated, 1);
    }

    #[test]
    fn test_retention_purges_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = collector(dir.path());

        let stale = dir.path().join("2020-01-01-queries.json");
        std::fs::write(&stale, b"[]").unwrap();
        let fresh = dir
            .path()
            .join(format!("{}-queries.json", Utc::now().format("%Y-%m-%d")));
        std::fs::write(&fresh, b"[]").unwrap();

        metrics.purge_stale_files();
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_truncate_sql() {
        let long = "x".repeat(400);
        let truncated = truncate_sql(&long);
        assert_eq!(truncated.len(), 203);
        assert!(truncated.ends_with("..."));
    }
}
