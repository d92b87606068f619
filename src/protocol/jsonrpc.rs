// JSON-RPC 2.0 frame types
//
// Every frame on the wire is an object with `jsonrpc: "2.0"`, an integer or
// string `id` on requests and responses, a `method` on requests and
// notifications, and one of `params`, `result`, or `error`.

use serde::{Deserialize, Serialize};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Request method
    pub method: String,

    /// Request parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    /// Request ID (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn request(id: i64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(serde_json::Value::from(id)),
        }
    }

    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Result (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    /// ID of the request being answered
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Classified incoming frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A response correlating to a request id we issued.
    Response(JsonRpcResponse),

    /// A server-initiated request or notification.
    Notification { method: String, params: Option<serde_json::Value> },

    /// Anything else; tolerated and reported to the caller.
    Unknown(serde_json::Value),
}

/// Classify a raw frame.
///
/// Frames carrying a `result` or `error` are responses; frames carrying a
/// `method` are notifications (welcome banners from TCP servers land here
/// too). Everything else is `Unknown`.
pub fn classify(value: serde_json::Value) -> Frame {
    let is_response = value.get("id").is_some()
        && (value.get("result").is_some() || value.get("error").is_some());
    if is_response {
        if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value.clone()) {
            return Frame::Response(response);
        }
        return Frame::Unknown(value);
    }

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        return Frame::Notification {
            method: method.to_string(),
            params: value.get("params").cloned(),
        };
    }

    Frame::Unknown(value)
}

/// Extract the integer request id from a response id value.
pub fn numeric_id(id: &serde_json::Value) -> Option<i64> {
    match id {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
