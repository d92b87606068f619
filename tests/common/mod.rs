// Shared fixtures for integration tests: an in-process MCP server speaking
// newline-delimited JSON-RPC over TCP, and a scripted in-memory engine that
// evaluates just enough SQL for the federation scenarios.

use async_trait::async_trait;
use base64::Engine as _;
use mcp_federation::engine::{ColumnInfo, Engine, FileFormat, Row, TableInfo};
use mcp_federation::error::{FederationError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// ---------------------------------------------------------------------------
// Mock MCP server
// ---------------------------------------------------------------------------

pub enum MockResource {
    Text { mime: Option<String>, body: String },
    Blob { mime: Option<String>, bytes: Vec<u8> },
    /// JSON array that grows by one row per read.
    Counter { reads: AtomicU64 },
    /// Always answers with a JSON-RPC error.
    Broken,
}

pub struct MockMcpServer {
    pub url: String,
    resources: Arc<Mutex<HashMap<String, Arc<MockResource>>>>,
    read_count: Arc<AtomicU64>,
    connection_count: Arc<AtomicU64>,
}

impl MockMcpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let resources: Arc<Mutex<HashMap<String, Arc<MockResource>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let read_count = Arc::new(AtomicU64::new(0));
        let connection_count = Arc::new(AtomicU64::new(0));

        {
            let resources = Arc::clone(&resources);
            let read_count = Arc::clone(&read_count);
            let connection_count = Arc::clone(&connection_count);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else { break };
                    connection_count.fetch_add(1, Ordering::SeqCst);
                    let resources = Arc::clone(&resources);
                    let read_count = Arc::clone(&read_count);
                    tokio::spawn(async move {
                        serve_connection(socket, resources, read_count).await;
                    });
                }
            });
        }

        Self {
            url: format!("tcp://127.0.0.1:{}", addr.port()),
            resources,
            read_count,
            connection_count,
        }
    }

    pub fn add_text(&self, uri: &str, mime: Option<&str>, body: &str) {
        self.resources.lock().insert(
            uri.to_string(),
            Arc::new(MockResource::Text {
                mime: mime.map(String::from),
                body: body.to_string(),
            }),
        );
    }

    pub fn add_blob(&self, uri: &str, mime: Option<&str>, bytes: &[u8]) {
        self.resources.lock().insert(
            uri.to_string(),
            Arc::new(MockResource::Blob {
                mime: mime.map(String::from),
                bytes: bytes.to_vec(),
            }),
        );
    }

    pub fn add_counter(&self, uri: &str) {
        self.resources.lock().insert(
            uri.to_string(),
            Arc::new(MockResource::Counter {
                reads: AtomicU64::new(0),
            }),
        );
    }

    pub fn add_broken(&self, uri: &str) {
        self.resources
            .lock()
            .insert(uri.to_string(), Arc::new(MockResource::Broken));
    }

    pub fn reads(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u64 {
        self.connection_count.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    mut socket: tokio::net::TcpStream,
    resources: Arc<Mutex<HashMap<String, Arc<MockResource>>>>,
    read_count: Arc<AtomicU64>,
) {
    let (read, mut write) = socket.split();
    let mut lines = BufReader::new(read).lines();

    // Welcome banner, as real TCP servers emit.
    let welcome = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "welcome",
        "params": {"server": "mock-mcp"}
    });
    let _ = write.write_all(welcome.to_string().as_bytes()).await;
    let _ = write.write_all(b"\n").await;

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&line) else { continue };
        let Some(id) = frame.get("id").cloned() else { continue };
        let method = frame.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => ok_frame(
                &id,
                serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "mock-mcp", "version": "1.0.0"}
                }),
            ),
            "resources/list" => {
                let listing: Vec<serde_json::Value> = resources
                    .lock()
                    .iter()
                    .map(|(uri, resource)| {
                        let mime = match resource.as_ref() {
                            MockResource::Text { mime, .. } => mime.clone(),
                            MockResource::Blob { mime, .. } => mime.clone(),
                            _ => None,
                        };
                        serde_json::json!({"uri": uri, "name": uri, "mimeType": mime})
                    })
                    .collect();
                ok_frame(&id, serde_json::json!({"resources": listing}))
            }
            "tools/list" => ok_frame(
                &id,
                serde_json::json!({"tools": [{"name": "echo", "description": "echo arguments"}]}),
            ),
            "tools/call" => {
                let args = frame
                    .pointer("/params/arguments")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                ok_frame(&id, serde_json::json!({"content": [{"type": "text"}], "echo": args}))
            }
            "resources/read" => {
                let uri = frame
                    .pointer("/params/uri")
                    .and_then(|u| u.as_str())
                    .unwrap_or("")
                    .to_string();
                let resource = resources.lock().get(&uri).cloned();
                match resource {
                    Some(resource) => {
                        read_count.fetch_add(1, Ordering::SeqCst);
                        match resource.as_ref() {
                            MockResource::Text { mime, body } => ok_frame(
                                &id,
                                serde_json::json!({
                                    "contents": [{"uri": uri, "mimeType": mime, "text": body}]
                                }),
                            ),
                            MockResource::Blob { mime, bytes } => {
                                let blob =
                                    base64::engine::general_purpose::STANDARD.encode(bytes);
                                ok_frame(
                                    &id,
                                    serde_json::json!({
                                        "contents": [{"uri": uri, "mimeType": mime, "blob": blob}]
                                    }),
                                )
                            }
                            MockResource::Counter { reads } => {
                                let n = reads.fetch_add(1, Ordering::SeqCst) + 1;
                                let rows: Vec<serde_json::Value> = (0..n)
                                    .map(|i| serde_json::json!({"tick": i}))
                                    .collect();
                                ok_frame(
                                    &id,
                                    serde_json::json!({
                                        "contents": [{
                                            "uri": uri,
                                            "mimeType": "application/json",
                                            "text": serde_json::Value::Array(rows).to_string()
                                        }]
                                    }),
                                )
                            }
                            MockResource::Broken => error_frame(&id, -32000, "resource exploded"),
                        }
                    }
                    None => error_frame(&id, -32002, "resource not found"),
                }
            }
            _ => error_frame(&id, -32601, "method not found"),
        };

        if write.write_all(reply.to_string().as_bytes()).await.is_err() {
            break;
        }
        if write.write_all(b"\n").await.is_err() {
            break;
        }
    }
}

fn ok_frame(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_frame(id: &serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// In-memory engine evaluating the small SQL subset the scenarios need:
/// `SELECT */COUNT(*)/cols FROM t [WHERE col = literal]`, plus
/// `CREATE [OR REPLACE] TABLE t AS SELECT * FROM s`.
#[derive(Default)]
pub struct MockEngine {
    pub tables: Mutex<HashMap<String, Vec<Row>>>,
    pub executed: Mutex<Vec<String>>,
    pub ingested_files: Mutex<Vec<(PathBuf, FileFormat)>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rows_of(&self, name: &str) -> Option<Vec<Row>> {
        self.tables.lock().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    /// `None` means "not a SELECT this engine understands" (recorded and
    /// answered with an empty result); `Some(Err)` means the named table
    /// does not exist.
    fn eval_select(&self, sql: &str) -> Option<Result<Vec<Row>>> {
        let trimmed = sql.trim().trim_end_matches(';');
        let rest = strip_prefix_ci(trimmed, "SELECT ")?;
        let from_at = find_ci(rest, " FROM ")?;
        let select_list = rest[..from_at].trim().to_string();
        let after_from = rest[from_at + " FROM ".len()..].trim();

        let (table_token, where_clause) = match find_ci(after_from, " WHERE ") {
            Some(at) => (
                after_from[..at].trim(),
                Some(after_from[at + " WHERE ".len()..].trim()),
            ),
            None => (after_from, None),
        };
        let table = table_token.trim_matches('"').to_string();
        if table.contains(char::is_whitespace) {
            // Joins and other shapes beyond this engine; answered empty.
            return None;
        }

        let rows = match self.tables.lock().get(&table).cloned() {
            Some(rows) => rows,
            None => {
                return Some(Err(FederationError::ExecuteFailed(format!(
                    "table {} does not exist",
                    table
                ))))
            }
        };
        let rows: Vec<Row> = match where_clause {
            Some(clause) => {
                let (col, value) = parse_condition(clause)?;
                rows.into_iter()
                    .filter(|row| row.get(&col).map(|v| value_matches(v, &value)).unwrap_or(false))
                    .collect()
            }
            None => rows,
        };

        if select_list == "*" {
            return Some(Ok(rows));
        }
        if select_list.eq_ignore_ascii_case("COUNT(*)") {
            let mut row = Row::new();
            row.insert("count".to_string(), serde_json::Value::from(rows.len() as u64));
            return Some(Ok(vec![row]));
        }

        let columns: Vec<String> = select_list
            .split(',')
            .map(|c| c.trim().trim_matches('"').to_string())
            .collect();
        Some(Ok(rows
            .into_iter()
            .map(|row| {
                let mut projected = Row::new();
                for column in &columns {
                    if let Some(value) = row.get(column) {
                        projected.insert(column.clone(), value.clone());
                    }
                }
                projected
            })
            .collect()))
    }

    fn eval_create_as(&self, sql: &str) -> bool {
        let trimmed = sql.trim().trim_end_matches(';');
        let rest = strip_prefix_ci(trimmed, "CREATE OR REPLACE TABLE ")
            .or_else(|| strip_prefix_ci(trimmed, "CREATE TABLE "));
        let Some(rest) = rest else { return false };
        let Some(as_at) = find_ci(rest, " AS SELECT * FROM ") else { return false };

        let target = rest[..as_at].trim().trim_matches('"').to_string();
        let source = rest[as_at + " AS SELECT * FROM ".len()..]
            .trim()
            .trim_matches('"')
            .to_string();

        let mut tables = self.tables.lock();
        let Some(rows) = tables.get(&source).cloned() else { return false };
        tables.insert(target, rows);
        true
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .to_ascii_uppercase()
        .find(&needle.to_ascii_uppercase())
}

fn parse_condition(clause: &str) -> Option<(String, serde_json::Value)> {
    let (col, raw) = clause.split_once('=')?;
    let col = col.trim().trim_matches('"').to_string();
    let raw = raw.trim();
    if let Some(stripped) = raw.strip_prefix('\'') {
        let value = stripped.strip_suffix('\'')?;
        return Some((col, serde_json::Value::from(value)));
    }
    let number: f64 = raw.parse().ok()?;
    Some((col, serde_json::json!(number)))
}

fn value_matches(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
            a.as_f64() == b.as_f64()
        }
        (serde_json::Value::String(a), b) => Some(a.as_str()) == b.as_str(),
        (a, serde_json::Value::String(b)) => a.to_string() == *b,
        _ => false,
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        self.executed.lock().push(sql.to_string());
        if self.eval_create_as(sql) {
            return Ok(Vec::new());
        }
        match self.eval_select(sql) {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }

    async fn create_table_from_rows(&self, name: &str, rows: &[Row]) -> Result<()> {
        self.tables.lock().insert(name.to_string(), rows.to_vec());
        Ok(())
    }

    async fn create_table_from_file(
        &self,
        name: &str,
        path: &Path,
        format: FileFormat,
    ) -> Result<()> {
        self.ingested_files.lock().push((path.to_path_buf(), format));
        let bytes = std::fs::read(path)
            .map_err(|e| FederationError::Io(format!("cannot read {:?}: {}", path, e)))?;

        let rows = match format {
            FileFormat::Csv => parse_csv(&String::from_utf8_lossy(&bytes)),
            FileFormat::Parquet => {
                let mut row = Row::new();
                row.insert("bytes".to_string(), serde_json::Value::from(bytes.len()));
                vec![row]
            }
            FileFormat::Json => {
                serde_json::from_slice::<Vec<Row>>(&bytes).unwrap_or_default()
            }
        };
        self.tables.lock().insert(name.to_string(), rows);
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
        self.tables
            .lock()
            .get(name)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| FederationError::NotFound(format!("no table {}", name)))
    }

    async fn get_columns(&self, name: &str) -> Result<Vec<ColumnInfo>> {
        let tables = self.tables.lock();
        let rows = tables
            .get(name)
            .ok_or_else(|| FederationError::NotFound(format!("no table {}", name)))?;
        Ok(rows
            .first()
            .map(|row| {
                row.keys()
                    .map(|key| ColumnInfo {
                        name: key.clone(),
                        data_type: "TEXT".to_string(),
                        nullable: true,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
        Ok(self
            .tables
            .lock()
            .keys()
            .map(|name| TableInfo {
                schema: "main".to_string(),
                name: name.clone(),
                table_type: "BASE TABLE".to_string(),
            })
            .collect())
    }
}

fn parse_csv(text: &str) -> Vec<Row> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else { return Vec::new() };
    let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();

    lines
        .map(|line| {
            let mut row = Row::new();
            for (column, value) in columns.iter().zip(line.split(',')) {
                row.insert(
                    column.clone(),
                    serde_json::Value::from(value.trim().to_string()),
                );
            }
            row
        })
        .collect()
}
