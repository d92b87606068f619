// Broker configuration
//
// Structured configuration for every federation component. Each struct
// round-trips through serde with per-field defaults so deployment presets
// can override only the fields they care about.

use crate::error::{FederationError, Result};
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Path handed to the embedded engine at startup.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Federation subsystem configuration.
    #[serde(default)]
    pub federation: FederationConfig,

    /// Metrics collection configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            federation: FederationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        self.federation.validate()?;
        self.metrics.validate()
    }
}

fn default_db_path() -> String {
    ":memory:".to_string()
}

/// Federation subsystem configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub router: RouterConfig,
}

impl FederationConfig {
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.pool.validate()?;
        self.router.validate()
    }
}

/// Resource registry and cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Whether fetched payloads are cached at all.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    /// Time-to-live for cached payloads, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cache entries. `None` means unbounded.
    #[serde(default)]
    pub cache_max_entries: Option<usize>,

    /// URI scheme prefix for federated references.
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_enabled: default_cache_enabled(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: None,
            namespace_prefix: default_namespace_prefix(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace_prefix.is_empty() {
            return Err(FederationError::Config(
                "namespace_prefix must not be empty".to_string(),
            ));
        }
        if self.cache_enabled && self.cache_ttl_secs == 0 {
            return Err(FederationError::Config(
                "cache_ttl_secs must be greater than 0 when caching is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_namespace_prefix() -> String {
    "mcp://".to_string()
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of simultaneously open server connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Timeout for a single transport connect attempt, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Number of connect attempts before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between connect attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Enable protocol-level keepalive pings on pooled clients.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,

    /// Transport kinds tried in order during auto-negotiation.
    #[serde(default = "default_transport_priority")]
    pub transport_priority: Vec<TransportKind>,

    /// Budget for a full negotiation pass across transports, in milliseconds.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            keep_alive: default_keep_alive(),
            transport_priority: default_transport_priority(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Preset used by gateway deployments, which multiplex many tenants
    /// over one broker process.
    pub fn gateway() -> Self {
        Self {
            max_connections: 50,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(FederationError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.transport_priority.is_empty() {
            return Err(FederationError::Config(
                "transport_priority must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

fn default_max_connections() -> usize {
    10
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_keep_alive() -> bool {
    true
}

fn default_transport_priority() -> Vec<TransportKind> {
    vec![
        TransportKind::Stdio,
        TransportKind::WebSocket,
        TransportKind::Tcp,
        TransportKind::Http,
    ]
}

fn default_negotiation_timeout_ms() -> u64 {
    10_000
}

/// Query router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Overall budget for one federated query, in milliseconds.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Fetch distinct federated references in parallel.
    #[serde(default = "default_parallel_queries")]
    pub parallel_queries: bool,

    /// Upper bound on concurrent fetches within one query.
    #[serde(default = "default_max_parallel_queries")]
    pub max_parallel_queries: usize,

    /// Prefix for generated temporary table names.
    #[serde(default = "default_temp_table_prefix")]
    pub temp_table_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            parallel_queries: default_parallel_queries(),
            max_parallel_queries: default_max_parallel_queries(),
            temp_table_prefix: default_temp_table_prefix(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_queries == 0 {
            return Err(FederationError::Config(
                "max_parallel_queries must be greater than 0".to_string(),
            ));
        }
        if self.temp_table_prefix.is_empty() {
            return Err(FederationError::Config(
                "temp_table_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn default_query_timeout_ms() -> u64 {
    60_000
}

fn default_parallel_queries() -> bool {
    true
}

fn default_max_parallel_queries() -> usize {
    5
}

fn default_temp_table_prefix() -> String {
    "mcp_temp_".to_string()
}

/// Per-virtual-table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualTableConfig {
    /// Delay first load until the table is referenced or loaded explicitly.
    #[serde(default)]
    pub lazy: bool,

    /// Truncate `Rows` payloads longer than this. `None` means unlimited.
    #[serde(default)]
    pub max_rows: Option<usize>,

    /// Periodically re-fetch and re-materialise the table.
    #[serde(default)]
    pub auto_refresh: bool,

    /// Interval between refreshes, in milliseconds. Ignored unless
    /// `auto_refresh` is set.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for VirtualTableConfig {
    fn default() -> Self {
        Self {
            lazy: false,
            max_rows: None,
            auto_refresh: false,
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl VirtualTableConfig {
    /// A refresh timer exists iff auto-refresh is on, the interval is
    /// positive, and the table is not lazy.
    pub fn wants_timer(&self) -> bool {
        self.auto_refresh && self.refresh_interval_ms > 0 && !self.lazy
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

fn default_refresh_interval_ms() -> u64 {
    60_000
}

/// Metrics collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Directory for persisted metric rollups.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Interval between buffer flushes, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Rotate a metrics file once it exceeds this size, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Purge metrics files older than this many days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            flush_interval_ms: default_flush_interval_ms(),
            max_file_size: default_max_file_size(),
            retention_days: default_retention_days(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(FederationError::Config(
                "flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(FederationError::Config(
                "max_file_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_retention_days() -> u32 {
    7
}
