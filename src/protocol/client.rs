// Protocol client
//
// JSON-RPC 2.0 over a `Transport`. Outgoing requests get monotonic ids and
// a slot in the pending table; a reader task correlates responses by id and
// dispatches everything else to the notification handler. `close` fails all
// pending requests before releasing the transport.

use super::jsonrpc::{self, Frame, JsonRpcRequest};
use super::payload::{self, ResourcePayload};
use super::{RemoteResource, RemoteTool};
use crate::error::{FederationError, Result};
use crate::transport::Transport;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between protocol-level keepalive pings.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type PendingTable = Arc<DashMap<i64, oneshot::Sender<Result<serde_json::Value>>>>;
type NotificationHandler = Box<dyn Fn(&str, Option<serde_json::Value>) + Send + Sync>;

/// JSON-RPC client bound to one transport.
pub struct ProtocolClient {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: PendingTable,
    notification_handler: Arc<parking_lot::RwLock<Option<NotificationHandler>>>,
    closed: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    keepalive: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProtocolClient {
    /// Connect the transport and start the reader task.
    pub async fn connect(transport: Box<dyn Transport>) -> Result<Arc<Self>> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        transport.connect().await?;

        let client = Arc::new(Self {
            transport: Arc::clone(&transport),
            next_id: AtomicI64::new(1),
            pending: Arc::new(DashMap::new()),
            notification_handler: Arc::new(parking_lot::RwLock::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reader: parking_lot::Mutex::new(None),
            keepalive: parking_lot::Mutex::new(None),
        });

        let reader = tokio::spawn(Self::read_loop(
            Arc::clone(&transport),
            Arc::clone(&client.pending),
            Arc::clone(&client.notification_handler),
            Arc::clone(&client.closed),
        ));
        *client.reader.lock() = Some(reader);

        Ok(client)
    }

    async fn read_loop(
        transport: Arc<dyn Transport>,
        pending: PendingTable,
        handler: Arc<parking_lot::RwLock<Option<NotificationHandler>>>,
        closed: Arc<AtomicBool>,
    ) {
        loop {
            let frame = match transport.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    if !closed.load(Ordering::SeqCst) {
                        tracing::debug!("{}: reader stopped: {}", transport.describe(), e);
                        Self::fail_pending(&pending, &e);
                    }
                    return;
                }
            };

            match jsonrpc::classify(frame) {
                Frame::Response(response) => {
                    let Some(id) = jsonrpc::numeric_id(&response.id) else {
                        tracing::warn!(
                            "{}: response with non-numeric id {:?}",
                            transport.describe(),
                            response.id
                        );
                        continue;
                    };
                    let Some((_, resolver)) = pending.remove(&id) else {
                        tracing::warn!("{}: response for unknown id {}", transport.describe(), id);
                        continue;
                    };
                    let outcome = match response.error {
                        Some(error) => Err(FederationError::Rpc {
                            code: error.code,
                            message: error.message,
                            data: error.data,
                        }),
                        None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
                    };
                    let _ = resolver.send(outcome);
                }
                Frame::Notification { method, params } => {
                    tracing::debug!("{}: notification {}", transport.describe(), method);
                    if let Some(handler) = handler.read().as_ref() {
                        handler(&method, params);
                    }
                }
                Frame::Unknown(value) => {
                    tracing::warn!("{}: unclassifiable frame: {}", transport.describe(), value);
                }
            }
        }
    }

    fn fail_pending(pending: &PendingTable, error: &FederationError) {
        let ids: Vec<i64> = pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, resolver)) = pending.remove(&id) {
                let _ = resolver.send(Err(error.clone()));
            }
        }
    }

    /// Issue a request and await its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FederationError::Transport("client closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = JsonRpcRequest::request(id, method, params).to_value();
        if let Err(e) = self.transport.send(frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(FederationError::Transport("client closed".to_string())),
            Err(_) => {
                self.pending.remove(&id);
                Err(FederationError::Timeout(format!(
                    "{} timed out after {:?}",
                    method, timeout
                )))
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FederationError::Transport("client closed".to_string()));
        }
        let frame = JsonRpcRequest::notification(method, params).to_value();
        self.transport.send(frame).await
    }

    /// Subscribe to unsolicited server notifications.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(&str, Option<serde_json::Value>) + Send + Sync + 'static,
    {
        *self.notification_handler.write() = Some(Box::new(handler));
    }

    /// Start periodic keepalive pings.
    pub fn start_keepalive(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.closed.load(Ordering::SeqCst) {
                    break;
                }
                if client.notify("ping", None).await.is_err() {
                    break;
                }
            }
        });
        *self.keepalive.lock() = Some(task);
    }

    /// Close the client: fail all pending requests, stop tasks, release the
    /// transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        Self::fail_pending(
            &self.pending,
            &FederationError::Transport("closed".to_string()),
        );
        self.transport.close().await
    }

    /// Whether the underlying transport is open and the client is usable.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    /// Kind of the negotiated transport.
    pub fn transport_kind(&self) -> crate::transport::TransportKind {
        self.transport.kind()
    }

    /// Peer description for logging.
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Ask the transport to tear down immediately (kills stdio subprocesses).
    pub async fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        Self::fail_pending(
            &self.pending,
            &FederationError::Transport("terminated".to_string()),
        );
        self.transport.terminate().await;
    }

    // ------------------------------------------------------------------
    // MCP method wrappers
    // ------------------------------------------------------------------

    /// Complete the protocol handshake.
    pub async fn initialize(&self) -> Result<serde_json::Value> {
        self.request(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-federation",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    /// List the server's resources.
    pub async fn list_resources(&self) -> Result<Vec<RemoteResource>> {
        let result = self
            .request("resources/list", None, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        match result.get("resources") {
            Some(resources) => serde_json::from_value(resources.clone()).map_err(|e| {
                FederationError::Protocol(format!("bad resources/list result: {}", e))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// List the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let result = self
            .request("tools/list", None, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        match result.get("tools") {
            Some(tools) => serde_json::from_value(tools.clone())
                .map_err(|e| FederationError::Protocol(format!("bad tools/list result: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Read one resource and decode its content.
    pub async fn read_resource(
        &self,
        uri: &str,
        mime_hint: Option<&str>,
    ) -> Result<ResourcePayload> {
        let result = self
            .request(
                "resources/read",
                Some(serde_json::json!({"uri": uri})),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        payload::decode_read_result(&result, uri, mime_hint).await
    }

    /// Invoke a server tool.
    pub async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(
            "tools/call",
            Some(serde_json::json!({"name": name, "arguments": args})),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{StateCell, TransportKind, TransportState};
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    /// Loopback transport: frames sent become responses scripted by a
    /// closure, injected frames surface through `recv`.
    struct ScriptedTransport {
        state: StateCell,
        outbound: mpsc::UnboundedSender<serde_json::Value>,
        inbound: Mutex<mpsc::UnboundedReceiver<serde_json::Value>>,
    }

    fn scripted_pair() -> (
        ScriptedTransport,
        mpsc::UnboundedReceiver<serde_json::Value>,
        mpsc::UnboundedSender<serde_json::Value>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            state: StateCell::new(),
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
        };
        (transport, out_rx, in_tx)
    }

    #[async_trait]
    impl crate::transport::Transport for ScriptedTransport {
        async fn connect(&self) -> crate::error::Result<()> {
            self.state.set(TransportState::Open);
            Ok(())
        }

        async fn send(&self, frame: serde_json::Value) -> crate::error::Result<()> {
            self.outbound
                .send(frame)
                .map_err(|_| FederationError::Transport("peer gone".to_string()))
        }

        async fn recv(&self) -> crate::error::Result<serde_json::Value> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| FederationError::Transport("closed".to_string()))
        }

        async fn close(&self) -> crate::error::Result<()> {
            self.state.set(TransportState::Closed);
            Ok(())
        }

        fn state(&self) -> TransportState {
            self.state.get()
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Tcp
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (transport, mut out_rx, in_tx) = scripted_pair();
        let client = ProtocolClient::connect(Box::new(transport)).await.unwrap();

        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                client
                    .request("resources/list", None, Duration::from_secs(2))
                    .await
            }
        });

        let sent = out_rx.recv().await.unwrap();
        assert_eq!(sent["method"], "resources/list");
        let id = sent["id"].clone();

        // Answer out of order: an unrelated notification first.
        in_tx
            .send(serde_json::json!({"jsonrpc": "2.0", "method": "log", "params": {}}))
            .unwrap();
        in_tx
            .send(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"resources": []}}))
            .unwrap();

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result["resources"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_rpc_error_surfaced() {
        let (transport, mut out_rx, in_tx) = scripted_pair();
        let client = ProtocolClient::connect(Box::new(transport)).await.unwrap();

        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("tools/call", None, Duration::from_secs(2)).await }
        });

        let sent = out_rx.recv().await.unwrap();
        in_tx
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": sent["id"],
                "error": {"code": -32000, "message": "tool exploded"}
            }))
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        match err {
            FederationError::Rpc { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "tool exploded");
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending() {
        let (transport, _out_rx, _in_tx) = scripted_pair();
        let client = ProtocolClient::connect(Box::new(transport)).await.unwrap();

        let err = client
            .request("slow/method", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Timeout(_)));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (transport, mut out_rx, _in_tx) = scripted_pair();
        let client = ProtocolClient::connect(Box::new(transport)).await.unwrap();

        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request("never", None, Duration::from_secs(10)).await }
        });
        // Wait until the request is on the wire.
        out_rx.recv().await.unwrap();

        client.close().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, FederationError::Transport(_)));

        // Idempotent.
        client.close().await.unwrap();
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let (transport, _out_rx, in_tx) = scripted_pair();
        let client = ProtocolClient::connect(Box::new(transport)).await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        client.set_notification_handler(move |method, _params| {
            let _ = seen_tx.send(method.to_string());
        });

        in_tx
            .send(serde_json::json!({"method": "welcome", "params": {"server": "mock"}}))
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "welcome");
    }
}
