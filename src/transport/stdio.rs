// Stdio transport
//
// Spawns the server as a subprocess and exchanges newline-delimited
// JSON-RPC frames over its stdin/stdout. Stderr is forwarded to the log.

use super::{ServerUrl, StateCell, Transport, TransportKind, TransportState};
use crate::config::PoolConfig;
use crate::error::{FederationError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Upper bound on a single frame line.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Grace period between closing stdin and killing the subprocess.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Subprocess-backed transport.
pub struct StdioTransport {
    url: ServerUrl,
    command: String,
    state: StateCell,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<Lines<BufReader<ChildStdout>>>>,
}

impl StdioTransport {
    pub fn new(url: ServerUrl, _config: &PoolConfig) -> Result<Self> {
        let command = url
            .command
            .clone()
            .ok_or_else(|| FederationError::Config(format!("not a stdio URL: {}", url.raw)))?;
        Ok(Self {
            url,
            command,
            state: StateCell::new(),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
        })
    }

}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        self.state.set(TransportState::Connecting);

        let mut child = Command::new(&self.command)
            .args(&self.url.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("failed to spawn {}: {}", self.command, e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            self.state.set(TransportState::Errored);
            FederationError::Transport("subprocess stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            self.state.set(TransportState::Errored);
            FederationError::Transport("subprocess stdout unavailable".to_string())
        })?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %command, "stderr: {}", line);
                }
            });
        }

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());
        *self.child.lock().await = Some(child);

        self.state.set(TransportState::Open);
        tracing::info!("spawned stdio server: {} {:?}", self.command, self.url.args);
        Ok(())
    }

    async fn send(&self, frame: serde_json::Value) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| FederationError::Transport("stdio transport not connected".to_string()))?;

        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        stdin.write_all(&line).await.map_err(|e| {
            self.state.set(TransportState::Errored);
            FederationError::Transport(format!("stdin write failed: {}", e))
        })?;
        stdin.flush().await.map_err(|e| {
            self.state.set(TransportState::Errored);
            FederationError::Transport(format!("stdin flush failed: {}", e))
        })?;
        Ok(())
    }

    async fn recv(&self) -> Result<serde_json::Value> {
        let mut guard = self.stdout.lock().await;
        let lines = guard
            .as_mut()
            .ok_or_else(|| FederationError::Transport("stdio transport not connected".to_string()))?;

        loop {
            let line = lines.next_line().await.map_err(|e| {
                self.state.set(TransportState::Errored);
                FederationError::Transport(format!("stdout read failed: {}", e))
            })?;
            let line = match line {
                Some(line) => line,
                None => {
                    self.state.set(TransportState::Closed);
                    return Err(FederationError::Transport(format!(
                        "subprocess {} exited",
                        self.command
                    )));
                }
            };
            if line.len() > MAX_FRAME_BYTES {
                self.state.set(TransportState::Errored);
                return Err(FederationError::Transport(format!(
                    "oversized frame from {}: {} bytes",
                    self.command,
                    line.len()
                )));
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map_err(|e| {
                FederationError::Protocol(format!("invalid frame from {}: {}", self.command, e))
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

        // Closing stdin signals the server to exit.
        drop(self.stdin.lock().await.take());
        drop(self.stdout.lock().await.take());

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("stdio server {} exited: {}", self.command, status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("wait for {} failed: {}", self.command, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "stdio server {} did not exit within {:?}, killing",
                        self.command,
                        SHUTDOWN_GRACE
                    );
                    let _ = child.kill().await;
                }
            }
        }

        self.state.set(TransportState::Closed);
        Ok(())
    }

    async fn terminate(&self) {
        drop(self.stdin.lock().await.take());
        drop(self.stdout.lock().await.take());
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("stdio terminate for {} failed: {}", self.command, e);
            }
        }
        self.state.set(TransportState::Closed);
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn describe(&self) -> String {
        format!("stdio:{} {:?}", self.command, self.url.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(raw: &str) -> StdioTransport {
        let url = ServerUrl::parse(raw).unwrap();
        StdioTransport::new(url, &PoolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_errored() {
        let t = transport("stdio://definitely-not-a-real-binary-xyz");
        assert!(t.connect().await.is_err());
        assert_eq!(t.state(), TransportState::Errored);
    }

    #[tokio::test]
    async fn test_close_before_connect_is_noop() {
        let t = transport("stdio://cat");
        assert!(t.close().await.is_ok());
        assert_eq!(t.state(), TransportState::NotCreated);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        // `cat` echoes frames verbatim, which is enough to exercise framing.
        let t = transport("stdio://cat");
        t.connect().await.unwrap();
        assert!(t.is_connected());

        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        t.send(frame.clone()).await.unwrap();
        let echoed = t.recv().await.unwrap();
        assert_eq!(echoed, frame);

        t.close().await.unwrap();
        assert_eq!(t.state(), TransportState::Closed);
        // Idempotent close.
        t.close().await.unwrap();
    }
}
