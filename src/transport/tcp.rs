// Raw TCP transport
//
// Newline-delimited JSON-RPC frames over a plain TCP stream. Keepalive is
// enabled at the socket level. Servers may emit welcome or notification
// frames immediately after connect; those flow through `recv` like any
// other frame and are dispatched as notifications by the protocol client.

use super::{ServerUrl, StateCell, Transport, TransportKind, TransportState};
use crate::config::PoolConfig;
use crate::error::{FederationError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Keepalive probe interval applied to the socket.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Raw TCP transport.
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    state: StateCell,
    reader: Mutex<Option<Lines<BufReader<OwnedReadHalf>>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpTransport {
    pub fn new(url: ServerUrl, config: &PoolConfig) -> Result<Self> {
        let addr = url.socket_addr()?;
        Ok(Self {
            addr,
            connect_timeout: config.connection_timeout(),
            state: StateCell::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        })
    }

    fn configure_socket(&self, stream: &TcpStream) -> Result<()> {
        stream
            .set_nodelay(true)
            .map_err(|e| FederationError::Transport(format!("failed to set TCP_NODELAY: {}", e)))?;

        let socket = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_INTERVAL)
            .with_interval(KEEPALIVE_INTERVAL);
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| FederationError::Transport(format!("failed to set keepalive: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        self.state.set(TransportState::Connecting);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                self.state.set(TransportState::Errored);
                FederationError::Timeout(format!(
                    "connect to {} timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("connect to {} failed: {}", self.addr, e))
            })?;

        self.configure_socket(&stream)?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(read_half).lines());
        *self.writer.lock().await = Some(write_half);

        self.state.set(TransportState::Open);
        tracing::info!("connected to tcp server at {}", self.addr);
        Ok(())
    }

    async fn send(&self, frame: serde_json::Value) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| FederationError::Transport("tcp transport not connected".to_string()))?;

        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        writer.write_all(&line).await.map_err(|e| {
            self.state.set(TransportState::Errored);
            FederationError::Transport(format!("tcp write to {} failed: {}", self.addr, e))
        })?;
        writer.flush().await.map_err(|e| {
            self.state.set(TransportState::Errored);
            FederationError::Transport(format!("tcp flush to {} failed: {}", self.addr, e))
        })?;
        Ok(())
    }

    async fn recv(&self) -> Result<serde_json::Value> {
        let mut guard = self.reader.lock().await;
        let lines = guard
            .as_mut()
            .ok_or_else(|| FederationError::Transport("tcp transport not connected".to_string()))?;

        loop {
            let line = lines.next_line().await.map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("tcp read from {} failed: {}", self.addr, e))
            })?;
            let line = match line {
                Some(line) => line,
                None => {
                    self.state.set(TransportState::Closed);
                    return Err(FederationError::Transport(format!(
                        "tcp connection to {} closed by peer",
                        self.addr
                    )));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map_err(|e| {
                FederationError::Protocol(format!("invalid frame from {}: {}", self.addr, e))
            });
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

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("tcp shutdown for {} failed: {}", self.addr, e);
            }
        }
        drop(self.reader.lock().await.take());

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
        format!("tcp:{}", self.addr)
    }
}
