// Resource mapper
//
// Turns a decoded payload into a concrete engine table. Row payloads go
// through the engine's row-import path; text is spooled to a temp CSV file
// for the engine's auto reader; Parquet files are handed to the engine's
// Parquet reader and unlinked afterwards whether or not the import
// succeeded. Refresh replaces contents through a staging table so readers
// see either the old rows or the new rows, never a half-filled table.

use crate::engine::{escape, ColumnInfo, Engine, FileFormat, Row};
use crate::error::{FederationError, Result};
use crate::protocol::ResourcePayload;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata for one mapped table.
#[derive(Debug, Clone, Serialize)]
pub struct MappedTable {
    pub name: String,
    pub source_uri: String,
    pub kind: String,
    pub row_count: u64,
    pub columns: Vec<ColumnInfo>,
    pub created_at: DateTime<Utc>,
    pub last_refresh: DateTime<Utc>,
}

/// Payload-to-table materialiser.
pub struct ResourceMapper {
    engine: Arc<dyn Engine>,
    tables: RwLock<HashMap<String, MappedTable>>,
}

impl ResourceMapper {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Materialise `payload` into a fresh engine table and record it.
    pub async fn map(
        &self,
        payload: &ResourcePayload,
        name: &str,
        source_uri: &str,
    ) -> Result<MappedTable> {
        let (kind, row_count, columns) = self.materialize(payload, name).await.map_err(|e| {
            FederationError::MaterializeFailed {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;

        let now = Utc::now();
        let record = MappedTable {
            name: name.to_string(),
            source_uri: source_uri.to_string(),
            kind: kind.to_string(),
            row_count,
            columns,
            created_at: now,
            last_refresh: now,
        };
        self.tables.write().insert(name.to_string(), record.clone());
        tracing::debug!("mapped {} ({} rows) from {}", name, row_count, source_uri);
        Ok(record)
    }

    /// Re-materialise an existing mapped table from a new payload.
    ///
    /// The new contents are staged under a scratch name and swapped in with
    /// one `CREATE OR REPLACE` statement; on any failure the previous table
    /// and its metadata stay intact.
    pub async fn refresh_with(&self, name: &str, payload: &ResourcePayload) -> Result<MappedTable> {
        let previous = self.tables.read().get(name).cloned().ok_or_else(|| {
            FederationError::NotFound(format!("no mapped table named {}", name))
        })?;

        let staging = format!("{}_staging_{}", name, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let staged = self.materialize(payload, &staging).await;
        let (kind, row_count, columns) = match staged {
            Ok(parts) => parts,
            Err(e) => {
                let _ = self.engine.drop_table(&staging).await;
                return Err(FederationError::MaterializeFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let swap = format!(
            "CREATE OR REPLACE TABLE {} AS SELECT * FROM {}",
            escape::ident(name),
            escape::ident(&staging)
        );
        if let Err(e) = self.engine.execute(&swap).await {
            let _ = self.engine.drop_table(&staging).await;
            return Err(FederationError::MaterializeFailed {
                name: name.to_string(),
                reason: e.to_string(),
            });
        }
        if let Err(e) = self.engine.drop_table(&staging).await {
            tracing::warn!("failed to drop staging table {}: {}", staging, e);
        }

        let record = MappedTable {
            name: previous.name,
            source_uri: previous.source_uri,
            kind: kind.to_string(),
            row_count,
            columns,
            created_at: previous.created_at,
            last_refresh: Utc::now(),
        };
        self.tables.write().insert(name.to_string(), record.clone());
        Ok(record)
    }

    /// Drop the engine table and forget its metadata.
    pub async fn unmap(&self, name: &str) -> Result<()> {
        self.engine.drop_table(name).await?;
        self.tables.write().remove(name);
        Ok(())
    }

    /// Metadata for one mapped table.
    pub fn get(&self, name: &str) -> Option<MappedTable> {
        self.tables.read().get(name).cloned()
    }

    /// Metadata for every mapped table.
    pub fn list(&self) -> Vec<MappedTable> {
        self.tables.read().values().cloned().collect()
    }

    /// Create the engine table for a payload, returning its shape.
    async fn materialize(
        &self,
        payload: &ResourcePayload,
        name: &str,
    ) -> Result<(&'static str, u64, Vec<ColumnInfo>)> {
        match payload {
            ResourcePayload::Rows(rows) => {
                self.engine.create_table_from_rows(name, rows).await?;
                Ok(("rows", rows.len() as u64, columns_from_rows(rows)))
            }
            ResourcePayload::Object(map) => {
                let rows = vec![map.clone()];
                self.engine.create_table_from_rows(name, &rows).await?;
                Ok(("rows", 1, columns_from_rows(&rows)))
            }
            ResourcePayload::Text(text) => {
                let path = spool_temp_file(text).await?;
                let imported = self
                    .engine
                    .create_table_from_file(name, &path, FileFormat::Csv)
                    .await;
                remove_file_best_effort(&path).await;
                imported?;
                let row_count = self.engine.row_count(name).await.unwrap_or(0);
                let columns = self.engine.get_columns(name).await.unwrap_or_default();
                Ok(("csv", row_count, columns))
            }
            ResourcePayload::ParquetFile(path) => {
                let imported = self
                    .engine
                    .create_table_from_file(name, path, FileFormat::Parquet)
                    .await;
                // The temp file is consumed here on every outcome.
                remove_file_best_effort(path).await;
                imported?;
                let row_count = self.engine.row_count(name).await.unwrap_or(0);
                let columns = self.engine.get_columns(name).await.unwrap_or_default();
                Ok(("parquet", row_count, columns))
            }
            ResourcePayload::Binary(bytes) => Err(FederationError::UnsupportedMedia(format!(
                "cannot materialise {} bytes of unrecognised binary content",
                bytes.len()
            ))),
        }
    }
}

/// Columns inferred from the first row; all text-typed.
fn columns_from_rows(rows: &[Row]) -> Vec<ColumnInfo> {
    rows.first()
        .map(|row| {
            row.keys()
                .map(|key| ColumnInfo {
                    name: key.clone(),
                    data_type: "TEXT".to_string(),
                    nullable: true,
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn spool_temp_file(text: &str) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("mcp_mapped_{}.csv", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, text)
        .await
        .map_err(|e| FederationError::Io(format!("failed to spool payload: {}", e)))?;
    Ok(path)
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove temp file {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TableInfo;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Engine double that records imports and can be told to fail.
    #[derive(Default)]
    struct RecordingEngine {
        tables: Mutex<HashMap<String, Vec<Row>>>,
        executed: Mutex<Vec<String>>,
        fail_imports: Mutex<bool>,
    }

    impl RecordingEngine {
        fn rows(&self, name: &str) -> Option<Vec<Row>> {
            self.tables.lock().get(name).cloned()
        }
    }

    #[async_trait]
    impl Engine for RecordingEngine {
        async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
            self.executed.lock().push(sql.to_string());
            // Only the staging swap reaches `execute` in these tests.
            if let Some(rest) = sql.strip_prefix("CREATE OR REPLACE TABLE ") {
                let parts: Vec<&str> = rest.splitn(2, " AS SELECT * FROM ").collect();
                if parts.len() == 2 {
                    let target = parts[0].trim_matches('"').to_string();
                    let source = parts[1].trim_matches('"').to_string();
                    let mut tables = self.tables.lock();
                    if let Some(rows) = tables.get(&source).cloned() {
                        tables.insert(target, rows);
                    }
                }
            }
            Ok(Vec::new())
        }

        async fn create_table_from_rows(&self, name: &str, rows: &[Row]) -> Result<()> {
            if *self.fail_imports.lock() {
                return Err(FederationError::ExecuteFailed("import disabled".to_string()));
            }
            self.tables.lock().insert(name.to_string(), rows.to_vec());
            Ok(())
        }

        async fn create_table_from_file(
            &self,
            name: &str,
            path: &Path,
            _format: FileFormat,
        ) -> Result<()> {
            if *self.fail_imports.lock() {
                return Err(FederationError::ExecuteFailed("import disabled".to_string()));
            }
            if !path.exists() {
                return Err(FederationError::Io(format!("missing file {:?}", path)));
            }
            self.tables.lock().insert(name.to_string(), Vec::new());
            Ok(())
        }

        async fn drop_table(&self, name: &str) -> Result<()> {
            self.tables.lock().remove(name);
            Ok(())
        }

        async fn table_exists(&self, name: &str, _schema: Option<&str>) -> Result<bool> {
            Ok(self.tables.lock().contains_key(name))
        }

        async fn row_count(&self, name: &str) -> Result<u64> {
            Ok(self.tables.lock().get(name).map(|r| r.len() as u64).unwrap_or(0))
        }

        async fn get_columns(&self, _name: &str) -> Result<Vec<ColumnInfo>> {
            Ok(Vec::new())
        }

        async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
            Ok(Vec::new())
        }
    }

    fn row(pairs: &[(&str, i64)]) -> Row {
        let mut row = Row::new();
        for (key, value) in pairs {
            row.insert(key.to_string(), serde_json::Value::from(*value));
        }
        row
    }

    #[tokio::test]
    async fn test_map_rows() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let payload = ResourcePayload::Rows(vec![row(&[("id", 1)]), row(&[("id", 2)])]);
        let record = mapper.map(&payload, "issues", "mcp://github/issues.json").await.unwrap();

        assert_eq!(record.row_count, 2);
        assert_eq!(record.kind, "rows");
        assert_eq!(record.columns.len(), 1);
        assert_eq!(record.columns[0].name, "id");
        assert_eq!(engine.rows("issues").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_map_object_is_one_row() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let payload = ResourcePayload::Object(row(&[("total", 9)]));
        let record = mapper.map(&payload, "stats", "mcp://s/stats.json").await.unwrap();
        assert_eq!(record.row_count, 1);
    }

    #[tokio::test]
    async fn test_map_binary_fails() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(engine as Arc<dyn Engine>);

        let payload = ResourcePayload::Binary(vec![0, 1]);
        let err = mapper.map(&payload, "bin", "mcp://s/x.bin").await.unwrap_err();
        assert!(matches!(err, FederationError::MaterializeFailed { .. }));
        assert!(mapper.get("bin").is_none());
    }

    #[tokio::test]
    async fn test_parquet_file_unlinked_on_success_and_failure() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(Arc::clone(&engine) as Arc<dyn Engine>);

        // Success path.
        let path = std::env::temp_dir().join(format!("map_test_{}.parquet", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"PAR1").unwrap();
        mapper
            .map(&ResourcePayload::ParquetFile(path.clone()), "pq_ok", "mcp://s/d.parquet")
            .await
            .unwrap();
        assert!(!path.exists());

        // Failure path: the file is still consumed.
        let path = std::env::temp_dir().join(format!("map_test_{}.parquet", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"PAR1").unwrap();
        *engine.fail_imports.lock() = true;
        let err = mapper
            .map(&ResourcePayload::ParquetFile(path.clone()), "pq_bad", "mcp://s/d.parquet")
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::MaterializeFailed { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_refresh_with_swaps_contents() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let first = ResourcePayload::Rows(vec![row(&[("id", 1)])]);
        mapper.map(&first, "live", "mcp://s/live.json").await.unwrap();

        let second = ResourcePayload::Rows(vec![row(&[("id", 1)]), row(&[("id", 2)])]);
        let record = mapper.refresh_with("live", &second).await.unwrap();

        assert_eq!(record.row_count, 2);
        assert_eq!(engine.rows("live").unwrap().len(), 2);
        // Staging table cleaned up.
        assert_eq!(engine.tables.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_contents() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let first = ResourcePayload::Rows(vec![row(&[("id", 1)])]);
        mapper.map(&first, "live", "mcp://s/live.json").await.unwrap();

        *engine.fail_imports.lock() = true;
        let bad = ResourcePayload::Rows(vec![row(&[("id", 2)])]);
        assert!(mapper.refresh_with("live", &bad).await.is_err());

        assert_eq!(engine.rows("live").unwrap().len(), 1);
        assert_eq!(mapper.get("live").unwrap().row_count, 1);
    }

    #[tokio::test]
    async fn test_unmap_drops_table_and_metadata() {
        let engine = Arc::new(RecordingEngine::default());
        let mapper = ResourceMapper::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let payload = ResourcePayload::Rows(vec![row(&[("id", 1)])]);
        mapper.map(&payload, "gone", "mcp://s/g.json").await.unwrap();
        mapper.unmap("gone").await.unwrap();

        assert!(engine.rows("gone").is_none());
        assert!(mapper.get("gone").is_none());
    }
}
