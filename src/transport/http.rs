// HTTP transport
//
// Three-endpoint REST binding: `POST /mcp/initialize` opens a session,
// `POST /mcp/request` carries request/response frames, `POST /mcp/message`
// carries notifications, `GET /mcp/poll` is an optional long-poll for
// server-to-client events, `POST /mcp/disconnect` ends the session. One
// JSON-RPC object per HTTP body.

use super::{ServerUrl, StateCell, Transport, TransportKind, TransportState};
use crate::config::PoolConfig;
use crate::error::{FederationError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Session id header attached to every request after initialize.
const SESSION_HEADER: &str = "X-MCP-Session";

/// Server-side hold time granted to the long-poll endpoint.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport.
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
    request_timeout: Duration,
    state: StateCell,
    session: parking_lot::Mutex<Option<String>>,
    poll_supported: AtomicBool,
    inbound_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<serde_json::Value>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<serde_json::Value>>,
}

impl HttpTransport {
    pub fn new(url: ServerUrl, config: &PoolConfig) -> Result<Self> {
        let base = url.http_base()?;

        let mut headers = http::HeaderMap::new();
        for (name, value) in &url.headers {
            let name = http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FederationError::Config(format!("bad header name {}: {}", name, e)))?;
            let value = http::HeaderValue::from_str(value)
                .map_err(|e| FederationError::Config(format!("bad header value: {}", e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| FederationError::Transport(format!("http client build failed: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            base,
            client,
            request_timeout: config.connection_timeout(),
            state: StateCell::new(),
            session: parking_lot::Mutex::new(None),
            poll_supported: AtomicBool::new(true),
            inbound_tx: parking_lot::Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/mcp/{}", self.base, path)
    }

    fn session_id(&self) -> Result<String> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| FederationError::Transport("http session not established".to_string()))
    }

    fn enqueue(&self, frame: serde_json::Value) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    async fn long_poll(&self) -> Result<usize> {
        let session = self.session_id()?;
        let response = self
            .client
            .get(self.endpoint("poll"))
            .header(SESSION_HEADER, &session)
            .timeout(POLL_TIMEOUT + Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| FederationError::Transport(format!("http poll failed: {}", e)))?;

        match response.status().as_u16() {
            404 | 405 => {
                self.poll_supported.store(false, Ordering::Relaxed);
                Ok(0)
            }
            204 => Ok(0),
            _ if response.status().is_success() => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| FederationError::Protocol(format!("bad poll body: {}", e)))?;
                let frames = match body {
                    serde_json::Value::Array(items) => items,
                    serde_json::Value::Null => Vec::new(),
                    other => vec![other],
                };
                let count = frames.len();
                for frame in frames {
                    self.enqueue(frame);
                }
                Ok(count)
            }
            status => Err(FederationError::Transport(format!(
                "http poll returned status {}",
                status
            ))),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        self.state.set(TransportState::Connecting);

        let response = self
            .client
            .post(self.endpoint("initialize"))
            .json(&serde_json::json!({}))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("http initialize to {} failed: {}", self.base, e))
            })?;

        if !response.status().is_success() {
            self.state.set(TransportState::Errored);
            return Err(FederationError::Transport(format!(
                "http initialize to {} returned status {}",
                self.base,
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FederationError::Protocol(format!("bad initialize body: {}", e)))?;
        let session = body
            .get("sessionId")
            .or_else(|| body.get("session_id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                self.state.set(TransportState::Errored);
                FederationError::Protocol("initialize response missing session id".to_string())
            })?
            .to_string();

        *self.session.lock() = Some(session);
        self.state.set(TransportState::Open);
        tracing::info!("http session established with {}", self.base);
        Ok(())
    }

    async fn send(&self, frame: serde_json::Value) -> Result<()> {
        let session = self.session_id()?;
        let is_request = frame.get("id").is_some();
        let path = if is_request { "request" } else { "message" };

        let response = self
            .client
            .post(self.endpoint(path))
            .header(SESSION_HEADER, &session)
            .json(&frame)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("http {} to {} failed: {}", path, self.base, e))
            })?;

        if !response.status().is_success() {
            return Err(FederationError::Transport(format!(
                "http {} returned status {}",
                path,
                response.status()
            )));
        }

        if is_request {
            // The response frame rides back in the HTTP body.
            let body = response
                .bytes()
                .await
                .map_err(|e| FederationError::Transport(format!("http body read failed: {}", e)))?;
            if !body.is_empty() {
                match serde_json::from_slice::<serde_json::Value>(&body) {
                    Ok(frame) if frame.is_object() => self.enqueue(frame),
                    Ok(_) => {}
                    Err(e) => {
                        return Err(FederationError::Protocol(format!(
                            "invalid response frame from {}: {}",
                            self.base, e
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<serde_json::Value> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(frame) => return Ok(frame),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(FederationError::Transport(
                        "http transport closed".to_string(),
                    ));
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            if self.poll_supported.load(Ordering::Relaxed) && self.is_connected() {
                // Long-poll for server-to-client events while staying
                // responsive to response frames enqueued by `send`.
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => return Ok(frame),
                        None => {
                            return Err(FederationError::Transport(
                                "http transport closed".to_string(),
                            ));
                        }
                    },
                    polled = self.long_poll() => {
                        polled?;
                    }
                }
                continue;
            }

            match rx.recv().await {
                Some(frame) => return Ok(frame),
                None => {
                    return Err(FederationError::Transport(
                        "http transport closed".to_string(),
                    ));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if matches!(
            self.state.get(),
            TransportState::Closed | TransportState::NotCreated
        ) {
            return Ok(());
        }
        self.state.set(TransportState::Closing);

        if let Ok(session) = self.session_id() {
            let _ = self
                .client
                .post(self.endpoint("disconnect"))
                .header(SESSION_HEADER, &session)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
        }

        *self.session.lock() = None;
        // Dropping the sender unblocks any pending recv.
        self.inbound_tx.lock().take();
        self.state.set(TransportState::Closed);
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn describe(&self) -> String {
        format!("http:{}", self.base)
    }
}
