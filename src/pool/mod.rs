// Connection pool
//
// Maps server URLs to live protocol clients. Transport selection follows
// the configured priority order; a connection counts as established only
// after the protocol-level `initialize` round-trip completes. Concurrent
// `get` calls for the same URL coalesce onto one in-flight connect.

use crate::config::PoolConfig;
use crate::error::{FederationError, Result};
use crate::metrics::MetricsCollector;
use crate::protocol::ProtocolClient;
use crate::transport::{create_transport, ServerUrl, TransportKind};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<ProtocolClient>>>>;

/// Options for a forced pool reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceResetOptions {
    /// Kill stdio subprocesses instead of waiting for graceful shutdown.
    pub kill_subprocess: bool,
}

/// Pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
}

/// Connection pool over all attached servers.
pub struct ConnectionPool {
    config: PoolConfig,
    clients: Arc<DashMap<String, Arc<ProtocolClient>>>,
    connecting: Arc<DashMap<String, ConnectFuture>>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: parking_lot::RwLock<Option<Arc<MetricsCollector>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            clients: Arc::new(DashMap::new()),
            connecting: Arc::new(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: parking_lot::RwLock::new(None),
        }
    }

    /// Wire the metrics collector; every `get` records a sample afterwards.
    pub fn set_metrics(&self, metrics: Arc<MetricsCollector>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Get a live client for `url`, connecting if necessary.
    pub async fn get(
        &self,
        url: &str,
        transport_hint: Option<TransportKind>,
    ) -> Result<Arc<ProtocolClient>> {
        if let Some(existing) = self.clients.get(url) {
            let client = Arc::clone(existing.value());
            drop(existing);
            if client.is_alive() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.record_sample();
                return Ok(client);
            }
            // Stale entry: drop it and reconnect below.
            self.clients.remove(url);
            let _ = client.close().await;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        if self.clients.len() >= self.config.max_connections {
            self.record_sample();
            return Err(FederationError::PoolExhausted {
                active: self.clients.len(),
                max: self.config.max_connections,
            });
        }

        let connect = self
            .connecting
            .entry(url.to_string())
            .or_insert_with(|| {
                Self::connect_task(
                    url.to_string(),
                    transport_hint,
                    self.config.clone(),
                    Arc::clone(&self.clients),
                    Arc::clone(&self.connecting),
                )
                .boxed()
                .shared()
            })
            .clone();

        let result = connect.await;
        self.record_sample();
        result
    }

    fn connect_task(
        url: String,
        transport_hint: Option<TransportKind>,
        config: PoolConfig,
        clients: Arc<DashMap<String, Arc<ProtocolClient>>>,
        connecting: Arc<DashMap<String, ConnectFuture>>,
    ) -> impl std::future::Future<Output = Result<Arc<ProtocolClient>>> {
        async move {
            let result = Self::negotiate(&url, transport_hint, &config).await;
            if let Ok(client) = &result {
                clients.insert(url.clone(), Arc::clone(client));
            }
            connecting.remove(&url);
            result
        }
    }

    /// Try transports in priority order until one completes the protocol
    /// handshake.
    async fn negotiate(
        url: &str,
        transport_hint: Option<TransportKind>,
        config: &PoolConfig,
    ) -> Result<Arc<ProtocolClient>> {
        let parsed = ServerUrl::parse(url)?;
        let candidates = match transport_hint {
            Some(kind) => vec![kind],
            None => parsed.candidates(&config.transport_priority),
        };
        if candidates.is_empty() {
            return Err(FederationError::Config(format!(
                "no transport in priority list can serve {}",
                url
            )));
        }

        let auto = transport_hint.is_none() && candidates.len() > 1;
        let attempt_all = Self::try_candidates(&parsed, &candidates, config);
        if auto {
            tokio::time::timeout(config.negotiation_timeout(), attempt_all)
                .await
                .map_err(|_| {
                    FederationError::Timeout(format!(
                        "transport negotiation for {} exceeded {:?}",
                        url,
                        config.negotiation_timeout()
                    ))
                })?
        } else {
            attempt_all.await
        }
    }

    async fn try_candidates(
        parsed: &ServerUrl,
        candidates: &[TransportKind],
        config: &PoolConfig,
    ) -> Result<Arc<ProtocolClient>> {
        let mut last_err = None;
        for kind in candidates {
            match Self::try_connect(parsed, *kind, config).await {
                Ok(client) => {
                    tracing::info!("negotiated {} transport for {}", kind, parsed.raw);
                    return Ok(client);
                }
                Err(e) => {
                    tracing::debug!("transport {} failed for {}: {}", kind, parsed.raw, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            FederationError::Transport(format!("all transports failed for {}", parsed.raw))
        }))
    }

    async fn try_connect(
        parsed: &ServerUrl,
        kind: TransportKind,
        config: &PoolConfig,
    ) -> Result<Arc<ProtocolClient>> {
        // The pool drives the retry loop; transports get one attempt each.
        let mut transport_config = config.clone();
        transport_config.retry_attempts = 1;

        let attempts = config.retry_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let transport = create_transport(kind, parsed, &transport_config)?;
            let connected = tokio::time::timeout(config.connection_timeout(), async {
                let client = ProtocolClient::connect(transport).await?;
                match client.initialize().await {
                    Ok(_) => Ok(client),
                    Err(e) => {
                        let _ = client.close().await;
                        Err(e)
                    }
                }
            })
            .await;

            match connected {
                Ok(Ok(client)) => {
                    if config.keep_alive {
                        client.start_keepalive();
                    }
                    return Ok(client);
                }
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(FederationError::Timeout(format!(
                        "connect to {} via {} exceeded {:?}",
                        parsed.raw,
                        kind,
                        config.connection_timeout()
                    )));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(config.retry_delay()).await;
            }
        }
        Err(last_err.unwrap_or_else(|| {
            FederationError::Transport(format!("connect to {} failed", parsed.raw))
        }))
    }

    /// Close and drop the client for `url`. No-op when absent.
    pub async fn reset(&self, url: &str) -> Result<()> {
        if let Some((_, client)) = self.clients.remove(url) {
            if let Err(e) = client.close().await {
                tracing::debug!("close during reset of {} failed: {}", url, e);
            }
        }
        Ok(())
    }

    /// Forcibly tear down the client for `url`.
    pub async fn force_reset(&self, url: &str, opts: ForceResetOptions) -> Result<()> {
        if let Some((_, client)) = self.clients.remove(url) {
            if opts.kill_subprocess {
                client.terminate().await;
            } else if let Err(e) = client.close().await {
                tracing::debug!("close during force reset of {} failed: {}", url, e);
            }
        }
        Ok(())
    }

    /// Close every pooled client.
    pub async fn reset_all(&self) {
        let urls: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for url in urls {
            let _ = self.reset(&url).await;
        }
    }

    /// Whether a live client is pooled for `url`.
    pub fn contains(&self, url: &str) -> bool {
        self.clients.get(url).map(|c| c.is_alive()).unwrap_or(false)
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.clients.len();
        let active = self.clients.iter().filter(|c| c.value().is_alive()).count();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let accesses = hits + misses;
        let hit_rate_pct = if accesses == 0 {
            0.0
        } else {
            hits as f64 * 100.0 / accesses as f64
        };
        PoolStats {
            total,
            active,
            hits,
            misses,
            hit_rate_pct,
        }
    }

    fn record_sample(&self) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            let stats = self.stats();
            metrics.record_connection(stats.total, stats.active, stats.hits, stats.misses);
        }
    }
}
