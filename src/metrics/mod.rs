// Metrics collection
//
// Buffered metric samples rolled up to per-day JSON files, with SLO
// threshold warnings emitted to the log when breached.

pub mod collector;
pub mod samples;

pub use collector::MetricsCollector;
pub use samples::{
    CacheSample, ConnectionSample, MemorySample, QuerySample, SampleKind, SummarySample,
};

/// SLO: average query time over the recent window, in milliseconds.
pub const SLO_AVG_QUERY_MS: f64 = 100.0;

/// SLO: a single query above this duration logs an immediate warning.
pub const SLO_SLOW_QUERY_MS: f64 = 1_000.0;

/// SLO: memory ceiling in bytes (4 GiB).
pub const SLO_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// SLO: pool hit rate floor, in percent.
pub const SLO_POOL_HIT_RATE_PCT: f64 = 80.0;

/// SLO: cache hit rate floor, in percent.
pub const SLO_CACHE_HIT_RATE_PCT: f64 = 60.0;

/// Accesses required before hit-rate SLOs are evaluated.
pub const SLO_MIN_ACCESSES: u64 = 10;

/// Window size for the rolling query-time average.
pub const QUERY_WINDOW: usize = 100;
