// Transport layer
//
// One implementation per wire protocol: pipe-based subprocess, HTTP
// JSON-RPC binding, WebSocket, raw TCP. Every implementation satisfies the
// same `Transport` contract; a frame is one JSON-RPC object.

pub mod http;
pub mod stdio;
pub mod tcp;
pub mod websocket;

pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

use crate::config::PoolConfig;
use crate::error::{FederationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Default port for raw TCP servers.
pub const DEFAULT_TCP_PORT: u16 = 9999;

/// Supported transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    WebSocket,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
            TransportKind::Tcp => "tcp",
        }
    }

    /// Whether this transport can serve a URL with the given scheme.
    pub fn applicable(&self, scheme: &str) -> bool {
        match self {
            TransportKind::Stdio => scheme == "stdio",
            TransportKind::Tcp => scheme == "tcp",
            TransportKind::WebSocket => {
                matches!(scheme, "ws" | "wss" | "http" | "https")
            }
            TransportKind::Http => matches!(scheme, "http" | "https"),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotCreated,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

/// Shared state cell used by every transport implementation.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<TransportState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TransportState::NotCreated)))
    }

    pub fn get(&self) -> TransportState {
        *self.0.lock()
    }

    pub fn set(&self, state: TransportState) {
        *self.0.lock() = state;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified transport contract.
///
/// `send` and `recv` move whole JSON-RPC frames; framing is
/// transport-specific (one line per frame on stdio and TCP, one message per
/// frame on WebSocket, one body per frame on HTTP).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Fails with a transport error.
    async fn connect(&self) -> Result<()>;

    /// Send one frame.
    async fn send(&self, frame: serde_json::Value) -> Result<()>;

    /// Receive the next frame.
    async fn recv(&self) -> Result<serde_json::Value>;

    /// Close the transport. Idempotent; releases OS resources.
    async fn close(&self) -> Result<()>;

    /// Tear down immediately, skipping any graceful shutdown sequence.
    /// Stdio transports kill the subprocess; others fall back to `close`.
    async fn terminate(&self) {
        let _ = self.close().await;
    }

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Boolean view of `state`.
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// The wire protocol this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Human-readable peer description for logging.
    fn describe(&self) -> String;
}

/// Parsed server address.
///
/// Conventions, kept bit-compatible with existing deployments:
/// - `stdio://cmd?args=a,b,c` - hostname is the executable when non-empty,
///   else the URL path; `args` is comma-separated.
/// - `tcp://host[:port]` - port defaults to 9999.
/// - `http(s)://` and `ws(s)://` - query params prefixed `header_X=Y`
///   become request headers `X: Y`.
#[derive(Debug, Clone)]
pub struct ServerUrl {
    /// The canonical URL string as given.
    pub raw: String,

    /// URL scheme, lowercased.
    pub scheme: String,

    /// Executable for stdio transports.
    pub command: Option<String>,

    /// Arguments for stdio transports.
    pub args: Vec<String>,

    /// Host for socket transports.
    pub host: Option<String>,

    /// Port for socket transports.
    pub port: Option<u16>,

    /// Custom headers for HTTP and WebSocket transports.
    pub headers: HashMap<String, String>,
}

impl ServerUrl {
    /// Parse a server address.
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw)?;
        let scheme = parsed.scheme().to_lowercase();

        let mut command = None;
        let mut args = Vec::new();
        let mut headers = HashMap::new();

        for (key, value) in parsed.query_pairs() {
            if key == "args" {
                args = value
                    .split(',')
                    .filter(|a| !a.is_empty())
                    .map(|a| a.to_string())
                    .collect();
            } else if let Some(header) = key.strip_prefix("header_") {
                headers.insert(header.to_string(), value.to_string());
            }
        }

        if scheme == "stdio" {
            let host = parsed.host_str().unwrap_or("");
            let exe = if host.is_empty() {
                parsed.path().to_string()
            } else {
                host.to_string()
            };
            if exe.is_empty() {
                return Err(FederationError::Config(format!(
                    "stdio URL has no executable: {}",
                    raw
                )));
            }
            command = Some(exe);
        }

        let host = parsed.host_str().map(|h| h.to_string());
        let port = match scheme.as_str() {
            "tcp" => Some(parsed.port().unwrap_or(DEFAULT_TCP_PORT)),
            _ => parsed.port_or_known_default(),
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            command,
            args,
            host,
            port,
            headers,
        })
    }

    /// Transport kinds applicable to this URL, in the given priority order.
    pub fn candidates(&self, priority: &[TransportKind]) -> Vec<TransportKind> {
        priority
            .iter()
            .copied()
            .filter(|kind| kind.applicable(&self.scheme))
            .collect()
    }

    /// Socket address string for TCP transports.
    pub fn socket_addr(&self) -> Result<String> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| FederationError::Config(format!("URL has no host: {}", self.raw)))?;
        let port = self.port.unwrap_or(DEFAULT_TCP_PORT);
        Ok(format!("{}:{}", host, port))
    }

    /// Base `http(s)://host:port` URL for the HTTP binding, with the query
    /// string stripped.
    pub fn http_base(&self) -> Result<String> {
        let mut parsed = url::Url::parse(&self.raw)?;
        parsed.set_query(None);
        let base = parsed.as_str().trim_end_matches('/').to_string();
        Ok(base)
    }

    /// `ws(s)://` form of this URL for WebSocket negotiation over an
    /// `http(s)://` address.
    pub fn websocket_url(&self) -> Result<String> {
        let mut parsed = url::Url::parse(&self.raw)?;
        let scheme = match self.scheme.as_str() {
            "http" => "ws",
            "https" => "wss",
            other => other,
        };
        parsed
            .set_scheme(scheme)
            .map_err(|_| FederationError::Config(format!("cannot derive ws URL from {}", self.raw)))?;
        parsed.set_query(None);
        Ok(parsed.to_string())
    }
}

/// Construct a transport of the given kind for a parsed URL.
pub fn create_transport(
    kind: TransportKind,
    url: &ServerUrl,
    config: &PoolConfig,
) -> Result<Box<dyn Transport>> {
    if !kind.applicable(&url.scheme) {
        return Err(FederationError::Config(format!(
            "transport {} cannot serve scheme {}",
            kind, url.scheme
        )));
    }
    match kind {
        TransportKind::Stdio => Ok(Box::new(StdioTransport::new(url.clone(), config)?)),
        TransportKind::Http => Ok(Box::new(HttpTransport::new(url.clone(), config)?)),
        TransportKind::WebSocket => Ok(Box::new(WebSocketTransport::new(url.clone(), config)?)),
        TransportKind::Tcp => Ok(Box::new(TcpTransport::new(url.clone(), config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_url_host_form() {
        let url = ServerUrl::parse("stdio://python?args=server.py,--port,8080").unwrap();
        assert_eq!(url.scheme, "stdio");
        assert_eq!(url.command.as_deref(), Some("python"));
        assert_eq!(url.args, vec!["server.py", "--port", "8080"]);
    }

    #[test]
    fn test_stdio_url_path_form() {
        let url = ServerUrl::parse("stdio:///usr/local/bin/mcp-server").unwrap();
        assert_eq!(url.command.as_deref(), Some("/usr/local/bin/mcp-server"));
        assert!(url.args.is_empty());
    }

    #[test]
    fn test_stdio_url_no_executable() {
        assert!(ServerUrl::parse("stdio://").is_err());
    }

    #[test]
    fn test_tcp_url_default_port() {
        let url = ServerUrl::parse("tcp://data.example.com").unwrap();
        assert_eq!(url.socket_addr().unwrap(), "data.example.com:9999");
    }

    #[test]
    fn test_tcp_url_explicit_port() {
        let url = ServerUrl::parse("tcp://10.0.0.2:4000").unwrap();
        assert_eq!(url.socket_addr().unwrap(), "10.0.0.2:4000");
    }

    #[test]
    fn test_http_url_header_params() {
        let url =
            ServerUrl::parse("https://api.example.com/mcp?header_Authorization=Bearer+tok&header_X-Tenant=acme")
                .unwrap();
        assert_eq!(
            url.headers.get("Authorization").map(String::as_str),
            Some("Bearer tok")
        );
        assert_eq!(url.headers.get("X-Tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_websocket_url_from_http() {
        let url = ServerUrl::parse("https://api.example.com/mcp?header_A=b").unwrap();
        assert_eq!(url.websocket_url().unwrap(), "wss://api.example.com/mcp");
    }

    #[test]
    fn test_candidates_filtered_by_scheme() {
        let priority = vec![
            TransportKind::Stdio,
            TransportKind::WebSocket,
            TransportKind::Tcp,
            TransportKind::Http,
        ];
        let stdio = ServerUrl::parse("stdio://cat").unwrap();
        assert_eq!(stdio.candidates(&priority), vec![TransportKind::Stdio]);

        let http = ServerUrl::parse("http://h:8080").unwrap();
        assert_eq!(
            http.candidates(&priority),
            vec![TransportKind::WebSocket, TransportKind::Http]
        );

        let tcp = ServerUrl::parse("tcp://h").unwrap();
        assert_eq!(tcp.candidates(&priority), vec![TransportKind::Tcp]);
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), TransportState::NotCreated);
        cell.set(TransportState::Open);
        assert_eq!(cell.get(), TransportState::Open);
    }
}
