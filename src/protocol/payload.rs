// Resource payload decoding
//
// A `resources/read` result carries content items with either inline `text`
// or a base64 `blob`. Decoding turns the first non-empty item into a tagged
// payload the mapper can materialise. Mime resolution order: explicit mime,
// then URI suffix, then content sniff.

use crate::engine::Row;
use crate::error::{FederationError, Result};
use base64::Engine as _;
use std::path::PathBuf;

/// Decoded resource content.
#[derive(Debug, Clone)]
pub enum ResourcePayload {
    /// A JSON array of objects.
    Rows(Vec<Row>),

    /// A single JSON object; one logical row.
    Object(Row),

    /// CSV, TSV, or plain text.
    Text(String),

    /// Parquet bytes written to a local temp file. The file is consumed
    /// (and unlinked) by the materialiser, so this variant is never cached.
    ParquetFile(PathBuf),

    /// Unrecognised binary content.
    Binary(Vec<u8>),
}

impl ResourcePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourcePayload::Rows(_) => "rows",
            ResourcePayload::Object(_) => "object",
            ResourcePayload::Text(_) => "text",
            ResourcePayload::ParquetFile(_) => "parquet",
            ResourcePayload::Binary(_) => "binary",
        }
    }

    /// Whether this payload may be stored in the resource cache.
    pub fn cacheable(&self) -> bool {
        !matches!(self, ResourcePayload::ParquetFile(_))
    }

    /// Row count for payloads with a known row shape.
    pub fn row_count(&self) -> Option<usize> {
        match self {
            ResourcePayload::Rows(rows) => Some(rows.len()),
            ResourcePayload::Object(_) => Some(1),
            _ => None,
        }
    }
}

/// Media classification used during decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Json,
    Csv,
    Parquet,
    Plain,
    Octet,
}

fn classify_mime(mime: &str) -> Option<MediaKind> {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("json") {
        Some(MediaKind::Json)
    } else if mime.contains("csv") || mime.contains("tab-separated") {
        Some(MediaKind::Csv)
    } else if mime.contains("parquet") {
        Some(MediaKind::Parquet)
    } else if mime.starts_with("text/") {
        Some(MediaKind::Plain)
    } else if mime.contains("octet") {
        Some(MediaKind::Octet)
    } else {
        None
    }
}

fn classify_suffix(uri: &str) -> Option<MediaKind> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let suffix = path.rsplit('.').next()?.to_ascii_lowercase();
    match suffix.as_str() {
        "json" | "ndjson" => Some(MediaKind::Json),
        "csv" | "tsv" => Some(MediaKind::Csv),
        "parquet" | "pq" => Some(MediaKind::Parquet),
        "txt" | "text" => Some(MediaKind::Plain),
        _ => None,
    }
}

fn sniff_text(text: &str) -> MediaKind {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return MediaKind::Json;
    }
    if text.lines().next().is_some_and(|line| line.contains(',')) {
        return MediaKind::Csv;
    }
    MediaKind::Plain
}

/// Resolve the media kind of a text content item.
fn resolve_text_kind(mime: Option<&str>, uri: &str, text: &str) -> MediaKind {
    mime.and_then(classify_mime)
        .or_else(|| classify_suffix(uri))
        .unwrap_or_else(|| sniff_text(text))
}

/// Resolve whether a blob content item is Parquet.
fn blob_is_parquet(mime: Option<&str>, uri: &str, bytes: &[u8]) -> bool {
    if let Some(kind) = mime.and_then(classify_mime) {
        return kind == MediaKind::Parquet;
    }
    if let Some(kind) = classify_suffix(uri) {
        return kind == MediaKind::Parquet;
    }
    bytes.starts_with(b"PAR1")
}

fn rows_from_array(items: Vec<serde_json::Value>) -> Vec<Row> {
    items
        .into_iter()
        .map(|item| match item {
            serde_json::Value::Object(map) => map,
            other => {
                let mut row = Row::new();
                row.insert("value".to_string(), other);
                row
            }
        })
        .collect()
}

fn decode_text(text: String, mime: Option<&str>, uri: &str) -> ResourcePayload {
    match resolve_text_kind(mime, uri, &text) {
        MediaKind::Json => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Array(items)) => ResourcePayload::Rows(rows_from_array(items)),
            Ok(serde_json::Value::Object(map)) => ResourcePayload::Object(map),
            Ok(_) | Err(_) => ResourcePayload::Text(text),
        },
        _ => ResourcePayload::Text(text),
    }
}

async fn decode_blob(blob: &str, mime: Option<&str>, uri: &str) -> Result<ResourcePayload> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .map_err(|e| FederationError::Protocol(format!("invalid base64 blob for {}: {}", uri, e)))?;

    if blob_is_parquet(mime, uri, &bytes) {
        let path = std::env::temp_dir().join(format!("mcp_resource_{}.parquet", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            FederationError::Io(format!("failed to write parquet temp file: {}", e))
        })?;
        tracing::debug!("wrote {} parquet bytes for {} to {:?}", bytes.len(), uri, path);
        return Ok(ResourcePayload::ParquetFile(path));
    }

    Ok(ResourcePayload::Binary(bytes))
}

/// Decode a `resources/read` result into a payload.
///
/// Picks the first content item whose `text` or `blob` is non-empty.
pub async fn decode_read_result(
    result: &serde_json::Value,
    uri: &str,
    mime_hint: Option<&str>,
) -> Result<ResourcePayload> {
    let contents = result
        .get("contents")
        .and_then(|c| c.as_array())
        .ok_or_else(|| {
            FederationError::Protocol(format!("resources/read result for {} has no contents", uri))
        })?;

    for item in contents {
        let mime = item
            .get("mimeType")
            .and_then(|m| m.as_str())
            .or(mime_hint);

        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                return Ok(decode_text(text.to_string(), mime, uri));
            }
        }
        if let Some(blob) = item.get("blob").and_then(|b| b.as_str()) {
            if !blob.is_empty() {
                return decode_blob(blob, mime, uri).await;
            }
        }
    }

    Err(FederationError::Protocol(format!(
        "resource {} has no non-empty content item",
        uri
    )))
}
