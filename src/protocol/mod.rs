// MCP protocol layer
//
// JSON-RPC 2.0 on top of a `Transport`: request/response correlation,
// notification dispatch, and decoding of `resources/read` results into
// tagged payloads.

pub mod client;
pub mod jsonrpc;
pub mod payload;

pub use client::ProtocolClient;
pub use jsonrpc::{Frame, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use payload::ResourcePayload;

use serde::{Deserialize, Serialize};

/// One resource entry from a server's `resources/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResource {
    pub uri: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One tool entry from a server's `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}
