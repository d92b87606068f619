// Engine facade
//
// The embedded analytical SQL engine is a collaborator: the broker drives it
// exclusively through this trait. Implementations are expected to be
// thread-safe; the broker never holds its own locks across engine calls.

pub mod escape;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One result or import row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// File formats the engine can ingest directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    Csv,
    Json,
    Parquet,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
            FileFormat::Parquet => "parquet",
        }
    }
}

/// Column description returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Table description returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub table_type: String,
}

/// Minimal facade over the embedded engine.
///
/// Every SQL identifier and string literal embedded in statements passed to
/// `execute` must already have gone through [`escape`].
#[async_trait]
pub trait Engine: Send + Sync {
    /// Execute an SQL statement and return the result rows.
    async fn execute(&self, sql: &str) -> Result<Vec<Row>>;

    /// Create a table from in-memory rows. Columns are inferred from the
    /// first row; all columns are text-typed.
    async fn create_table_from_rows(&self, name: &str, rows: &[Row]) -> Result<()>;

    /// Create a table by ingesting a local file.
    async fn create_table_from_file(
        &self,
        name: &str,
        path: &Path,
        format: FileFormat,
    ) -> Result<()>;

    /// Drop a table if it exists.
    async fn drop_table(&self, name: &str) -> Result<()>;

    /// Check whether a table exists in the given schema (default schema
    /// when `None`).
    async fn table_exists(&self, name: &str, schema: Option<&str>) -> Result<bool>;

    /// Number of rows in a table.
    async fn row_count(&self, name: &str) -> Result<u64>;

    /// Column descriptions for a table.
    async fn get_columns(&self, name: &str) -> Result<Vec<ColumnInfo>>;

    /// List tables, optionally restricted to one schema.
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>>;
}
