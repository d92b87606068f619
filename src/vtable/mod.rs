// Virtual table manager
//
// A virtual table is a persistent, named materialisation of one remote
// resource, with optional lazy first load, a row cap, and a periodic
// refresh timer. Refreshes are serialised per table: a refresh firing while
// the previous one still runs is skipped, never queued. Dropping a table
// stops its timer and waits for any in-flight refresh to settle before the
// engine table goes away.

use crate::config::VirtualTableConfig;
use crate::engine::{escape, ColumnInfo, Engine};
use crate::error::{FederationError, Result};
use crate::fetch::ResourceFetcher;
use crate::mapper::ResourceMapper;
use crate::protocol::ResourcePayload;
use crate::registry::{ResourceRegistry, ResolvedRef};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One virtual table record.
pub struct VirtualTable {
    name: String,
    alias: String,
    remote_uri: String,
    config: RwLock<VirtualTableConfig>,
    loaded: AtomicBool,
    /// Serialises load/refresh per table; `drop` waits on it.
    refresh_gate: tokio::sync::Mutex<()>,
    timer: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VirtualTable {
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

/// Serializable view of a virtual table.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualTableInfo {
    pub name: String,
    pub source_uri: String,
    pub config: VirtualTableConfig,
    pub loaded: bool,
    pub row_count: u64,
    pub columns: Vec<ColumnInfo>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Lifecycle manager for virtual tables.
pub struct VirtualTableManager {
    engine: Arc<dyn Engine>,
    mapper: Arc<ResourceMapper>,
    fetcher: Arc<ResourceFetcher>,
    registry: Arc<ResourceRegistry>,
    tables: RwLock<HashMap<String, Arc<VirtualTable>>>,
}

impl VirtualTableManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        mapper: Arc<ResourceMapper>,
        fetcher: Arc<ResourceFetcher>,
        registry: Arc<ResourceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            mapper,
            fetcher,
            registry,
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Create a virtual table over `uri` (federated form, or relative with
    /// an explicit alias). Eager tables load immediately.
    pub async fn create_virtual_table(
        self: &Arc<Self>,
        name: &str,
        uri: &str,
        alias: Option<&str>,
        config: VirtualTableConfig,
    ) -> Result<VirtualTableInfo> {
        let (alias, remote_uri) = if uri.starts_with(self.registry.namespace_prefix()) {
            self.registry.parse_federated(uri)?
        } else {
            let alias = alias.ok_or_else(|| {
                FederationError::ReferenceUnresolved(format!(
                    "relative URI {} needs an explicit server alias",
                    uri
                ))
            })?;
            (alias.to_string(), uri.to_string())
        };

        if !self.registry.contains(&alias) {
            return Err(FederationError::ReferenceUnresolved(format!(
                "no server registered as {}",
                alias
            )));
        }
        {
            let tables = self.tables.read();
            if tables.contains_key(name) {
                return Err(FederationError::AlreadyExists(format!(
                    "virtual table {} already exists",
                    name
                )));
            }
        }

        let record = Arc::new(VirtualTable {
            name: name.to_string(),
            alias,
            remote_uri,
            config: RwLock::new(config.clone()),
            loaded: AtomicBool::new(false),
            refresh_gate: tokio::sync::Mutex::new(()),
            timer: parking_lot::Mutex::new(None),
        });

        {
            let mut tables = self.tables.write();
            if tables.contains_key(name) {
                return Err(FederationError::AlreadyExists(format!(
                    "virtual table {} already exists",
                    name
                )));
            }
            tables.insert(name.to_string(), Arc::clone(&record));
        }

        if !config.lazy {
            if let Err(e) = self.load_record(&record).await {
                self.tables.write().remove(name);
                return Err(e);
            }
        } else {
            tracing::debug!("virtual table {} created lazily", name);
        }

        if config.wants_timer() {
            self.start_timer(&record);
        }

        Ok(self.info_for(&record))
    }

    /// Load a virtual table's contents. Idempotent: a loaded table is left
    /// alone.
    pub async fn load_virtual_table(self: &Arc<Self>, name: &str) -> Result<()> {
        let record = self.record(name)?;
        self.load_record(&record).await
    }

    /// Re-fetch (bypassing the cache) and swap in new contents. Returns
    /// false when a refresh was already running and this one was skipped.
    pub async fn refresh_virtual_table(self: &Arc<Self>, name: &str) -> Result<bool> {
        let record = self.record(name)?;
        if !record.is_loaded() {
            self.load_record(&record).await?;
            return Ok(true);
        }
        Self::refresh_record(
            &record,
            &self.registry,
            &self.fetcher,
            &self.mapper,
        )
        .await
    }

    /// Stop the timer, wait out any in-flight refresh, drop the engine
    /// table, and forget the record.
    pub async fn drop_virtual_table(self: &Arc<Self>, name: &str) -> Result<()> {
        let record = {
            let mut tables = self.tables.write();
            tables.remove(name).ok_or_else(|| {
                FederationError::NotFound(format!("no virtual table named {}", name))
            })?
        };

        if let Some(timer) = record.timer.lock().take() {
            timer.abort();
        }
        // Wait for an in-flight refresh to settle before the table vanishes.
        let _gate = record.refresh_gate.lock().await;

        if record.is_loaded() {
            self.mapper.unmap(name).await?;
        }
        tracing::info!("dropped virtual table {}", name);
        Ok(())
    }

    /// Replace a table's config, restarting or stopping its timer to match.
    pub async fn update_config(
        self: &Arc<Self>,
        name: &str,
        new_config: VirtualTableConfig,
    ) -> Result<()> {
        let record = self.record(name)?;

        if let Some(timer) = record.timer.lock().take() {
            timer.abort();
        }
        // Let an in-flight refresh settle so no refresh outlives this call.
        drop(record.refresh_gate.lock().await);

        *record.config.write() = new_config.clone();
        if new_config.wants_timer() {
            self.start_timer(&record);
        }
        Ok(())
    }

    /// Snapshot a virtual table into a plain engine table.
    pub async fn materialize(
        self: &Arc<Self>,
        virtual_name: &str,
        snapshot_name: &str,
    ) -> Result<()> {
        let record = self.record(virtual_name)?;
        self.load_record(&record).await?;

        let sql = format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            escape::ident(snapshot_name),
            escape::ident(virtual_name)
        );
        self.engine
            .execute(&sql)
            .await
            .map_err(|e| FederationError::ExecuteFailed(e.to_string()))?;
        tracing::info!("materialised {} as {}", virtual_name, snapshot_name);
        Ok(())
    }

    /// Names of lazy, not-yet-loaded tables referenced by `sql`
    /// (case-insensitive whole-word match; may false-match inside string
    /// literals, which mirrors the query hook's historical behaviour).
    pub fn lazy_targets(&self, sql: &str) -> Vec<String> {
        let tables = self.tables.read();
        tables
            .values()
            .filter(|record| !record.is_loaded() && record.config.read().lazy)
            .filter(|record| {
                regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&record.name)))
                    .map(|pattern| pattern.is_match(sql))
                    .unwrap_or(false)
            })
            .map(|record| record.name.clone())
            .collect()
    }

    /// Force-load every lazy table referenced by `sql`.
    pub async fn ensure_loaded_for(self: &Arc<Self>, sql: &str) -> Result<()> {
        for name in self.lazy_targets(sql) {
            self.load_virtual_table(&name).await?;
        }
        Ok(())
    }

    /// Info for one table.
    pub fn get(&self, name: &str) -> Option<VirtualTableInfo> {
        self.tables.read().get(name).map(|record| self.info_for(record))
    }

    /// Info for every table.
    pub fn list(&self) -> Vec<VirtualTableInfo> {
        self.tables.read().values().map(|record| self.info_for(record)).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every virtual table; used by broker shutdown.
    pub async fn drop_all(self: &Arc<Self>) {
        let names: Vec<String> = self.tables.read().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.drop_virtual_table(&name).await {
                tracing::warn!("dropping virtual table {} failed: {}", name, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn record(&self, name: &str) -> Result<Arc<VirtualTable>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FederationError::NotFound(format!("no virtual table named {}", name)))
    }

    fn info_for(&self, record: &Arc<VirtualTable>) -> VirtualTableInfo {
        let mapped = self.mapper.get(&record.name);
        VirtualTableInfo {
            name: record.name.clone(),
            source_uri: format!(
                "{}{}/{}",
                self.registry.namespace_prefix(),
                record.alias,
                record.remote_uri
            ),
            config: record.config.read().clone(),
            loaded: record.is_loaded(),
            row_count: mapped.as_ref().map(|m| m.row_count).unwrap_or(0),
            columns: mapped.as_ref().map(|m| m.columns.clone()).unwrap_or_default(),
            created_at: mapped.as_ref().map(|m| m.created_at),
            last_refresh: mapped.map(|m| m.last_refresh),
        }
    }

    async fn load_record(self: &Arc<Self>, record: &Arc<VirtualTable>) -> Result<()> {
        if record.is_loaded() {
            return Ok(());
        }
        let _gate = record.refresh_gate.lock().await;
        if record.is_loaded() {
            return Ok(());
        }

        let resolved = self
            .registry
            .resolve_relative(&record.alias, &record.remote_uri)?;
        let payload = self.fetcher.fetch(&resolved).await?;
        let payload = apply_row_cap(payload, record.config.read().max_rows, &record.name);

        let uri = resolved.reference.federated_uri(self.registry.namespace_prefix());
        self.mapper.map(&payload, &record.name, &uri).await?;
        record.loaded.store(true, Ordering::SeqCst);
        tracing::info!("loaded virtual table {}", record.name);
        Ok(())
    }

    /// Refresh one record. Returns false when another refresh held the gate.
    async fn refresh_record(
        record: &Arc<VirtualTable>,
        registry: &Arc<ResourceRegistry>,
        fetcher: &Arc<ResourceFetcher>,
        mapper: &Arc<ResourceMapper>,
    ) -> Result<bool> {
        let Ok(_gate) = record.refresh_gate.try_lock() else {
            tracing::debug!("refresh of {} skipped: previous refresh still running", record.name);
            return Ok(false);
        };

        let resolved: ResolvedRef = registry.resolve_relative(&record.alias, &record.remote_uri)?;
        let payload: ResourcePayload = fetcher.fetch_fresh(&resolved).await?;
        let payload = apply_row_cap(payload, record.config.read().max_rows, &record.name);

        mapper.refresh_with(&record.name, &payload).await?;
        tracing::debug!("refreshed virtual table {}", record.name);
        Ok(true)
    }

    fn start_timer(self: &Arc<Self>, record: &Arc<VirtualTable>) {
        let interval = record.config.read().refresh_interval();
        let record_task = Arc::clone(record);
        let registry = Arc::clone(&self.registry);
        let fetcher = Arc::clone(&self.fetcher);
        let mapper = Arc::clone(&self.mapper);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match Self::refresh_record(&record_task, &registry, &fetcher, &mapper).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!("timer tick for {} dropped: refresh in progress", record_task.name);
                    }
                    Err(e) => {
                        // Recovered locally: the table keeps its previous
                        // contents and the timer stays armed.
                        tracing::warn!("auto-refresh of {} failed: {}", record_task.name, e);
                    }
                }
            }
        });
        *record.timer.lock() = Some(handle);
    }
}

/// Truncate `Rows` payloads beyond the configured cap.
fn apply_row_cap(payload: ResourcePayload, max_rows: Option<usize>, name: &str) -> ResourcePayload {
    let Some(cap) = max_rows else { return payload };
    match payload {
        ResourcePayload::Rows(mut rows) if rows.len() > cap => {
            tracing::warn!(
                "virtual table {}: payload has {} rows, truncating to {}",
                name,
                rows.len(),
                cap
            );
            rows.truncate(cap);
            ResourcePayload::Rows(rows)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Row;

    fn rows(n: usize) -> ResourcePayload {
        ResourcePayload::Rows(
            (0..n)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("id".to_string(), serde_json::Value::from(i as u64));
                    row
                })
                .collect(),
        )
    }

    #[test]
    fn test_row_cap_truncates() {
        let capped = apply_row_cap(rows(10), Some(3), "t");
        match capped {
            ResourcePayload::Rows(rows) => assert_eq!(rows.len(), 3),
            other => panic!("unexpected payload {}", other.kind()),
        }
    }

    #[test]
    fn test_row_cap_no_op_under_cap() {
        let untouched = apply_row_cap(rows(2), Some(5), "t");
        assert_eq!(untouched.row_count(), Some(2));
        let unlimited = apply_row_cap(rows(9), None, "t");
        assert_eq!(unlimited.row_count(), Some(9));
    }

    #[test]
    fn test_row_cap_leaves_text_alone() {
        let text = apply_row_cap(ResourcePayload::Text("a,b\n1,2".to_string()), Some(1), "t");
        assert!(matches!(text, ResourcePayload::Text(_)));
    }
}
