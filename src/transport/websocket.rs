// WebSocket transport
//
// Single persistent socket carrying one JSON-RPC object per message.
// Connection attempts retry with capped exponential backoff; a periodic
// ping keeps intermediaries from idling the connection out.

use super::{ServerUrl, StateCell, Transport, TransportKind, TransportState};
use crate::config::PoolConfig;
use crate::error::{FederationError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Interval between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Cap on the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// WebSocket transport.
pub struct WebSocketTransport {
    ws_url: String,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    state: StateCell,
    sink: Arc<Mutex<Option<WsSink>>>,
    stream: Mutex<Option<WsStream>>,
    ping_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: ServerUrl, config: &PoolConfig) -> Result<Self> {
        let ws_url = url.websocket_url()?;
        let headers = url
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            ws_url,
            headers,
            connect_timeout: config.connection_timeout(),
            max_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
            state: StateCell::new(),
            sink: Arc::new(Mutex::new(None)),
            stream: Mutex::new(None),
            ping_task: Mutex::new(None),
        })
    }

    fn client_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| FederationError::Config(format!("bad websocket URL {}: {}", self.ws_url, e)))?;
        for (name, value) in &self.headers {
            let name = http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FederationError::Config(format!("bad header name {}: {}", name, e)))?;
            let value = http::HeaderValue::from_str(value)
                .map_err(|e| FederationError::Config(format!("bad header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    async fn connect_once(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let request = self.client_request()?;
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(request))
                .await
                .map_err(|_| {
                    FederationError::Timeout(format!(
                        "websocket connect to {} timed out after {:?}",
                        self.ws_url, self.connect_timeout
                    ))
                })?
                .map_err(|e| {
                    FederationError::Transport(format!(
                        "websocket connect to {} failed: {}",
                        self.ws_url, e
                    ))
                })?;
        Ok(stream)
    }

    fn start_ping_task(&self, sink: Arc<Mutex<Option<WsSink>>>) -> tokio::task::JoinHandle<()> {
        let url = self.ws_url.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut guard = sink.lock().await;
                let Some(sink) = guard.as_mut() else { break };
                if sink.send(Message::Ping(bytes::Bytes::new())).await.is_err() {
                    tracing::debug!("websocket ping to {} failed, stopping keepalive", url);
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<()> {
        self.state.set(TransportState::Connecting);

        let mut backoff = self.retry_delay;
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match self.connect_once().await {
                Ok(stream) => {
                    let (sink, stream) = stream.split();
                    *self.sink.lock().await = Some(sink);
                    *self.stream.lock().await = Some(stream);
                    let ping = self.start_ping_task(Arc::clone(&self.sink));
                    *self.ping_task.lock().await = Some(ping);
                    self.state.set(TransportState::Open);
                    tracing::info!("websocket connected to {} (attempt {})", self.ws_url, attempt);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "websocket connect to {} failed (attempt {}/{}): {}",
                        self.ws_url,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                    }
                }
            }
        }

        self.state.set(TransportState::Errored);
        Err(last_err.unwrap_or_else(|| {
            FederationError::Transport(format!("websocket connect to {} failed", self.ws_url))
        }))
    }

    async fn send(&self, frame: serde_json::Value) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| {
            FederationError::Transport("websocket transport not connected".to_string())
        })?;
        sink.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("websocket send to {} failed: {}", self.ws_url, e))
            })
    }

    async fn recv(&self) -> Result<serde_json::Value> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            FederationError::Transport("websocket transport not connected".to_string())
        })?;

        loop {
            let message = stream.next().await;
            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.state.set(TransportState::Errored);
                    return Err(FederationError::Transport(format!(
                        "websocket read from {} failed: {}",
                        self.ws_url, e
                    )));
                }
                None => {
                    self.state.set(TransportState::Closed);
                    return Err(FederationError::Transport(format!(
                        "websocket connection to {} closed",
                        self.ws_url
                    )));
                }
            };

            match message {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).map_err(|e| {
                        FederationError::Protocol(format!(
                            "invalid frame from {}: {}",
                            self.ws_url, e
                        ))
                    });
                }
                Message::Binary(data) => {
                    return serde_json::from_slice(&data).map_err(|e| {
                        FederationError::Protocol(format!(
                            "invalid binary frame from {}: {}",
                            self.ws_url, e
                        ))
                    });
                }
                Message::Ping(payload) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(_) => {
                    self.state.set(TransportState::Closed);
                    return Err(FederationError::Transport(format!(
                        "websocket connection to {} closed by peer",
                        self.ws_url
                    )));
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

        if let Some(task) = self.ping_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        drop(self.stream.lock().await.take());

        self.state.set(TransportState::Closed);
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn describe(&self) -> String {
        format!("ws:{}", self.ws_url)
    }
}
