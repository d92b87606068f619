// Metric sample types
//
// One struct per sample kind; all carry a wall-clock timestamp and persist
// as JSON array elements in the per-day rollup files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sample kinds, one rollup file per kind per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    Queries,
    Memory,
    Connections,
    Cache,
    Summary,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleKind::Queries => "queries",
            SampleKind::Memory => "memory",
            SampleKind::Connections => "connections",
            SampleKind::Cache => "cache",
            SampleKind::Summary => "summary",
        }
    }
}

/// One executed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySample {
    pub timestamp: DateTime<Utc>,
    pub sql: String,
    pub duration_ms: f64,
    pub row_count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,

    /// True when the query completed under the simple-query threshold.
    pub is_simple: bool,
}

/// One memory reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub total_mb: f64,
}

/// One connection-pool reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSample {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub active: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
}

/// One resource-cache reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSample {
    pub timestamp: DateTime<Utc>,
    pub total: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
    pub entries: usize,
}

/// Per-flush rollup written to the summary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySample {
    pub timestamp: DateTime<Utc>,
    pub query_count: usize,
    pub avg_query_ms: f64,
    pub pool_hit_rate_pct: f64,
    pub cache_hit_rate_pct: f64,
}

pub fn hit_rate_pct(hits: u64, misses: u64) -> f64 {
    let accesses = hits + misses;
    if accesses == 0 {
        0.0
    } else {
        hits as f64 * 100.0 / accesses as f64
    }
}
