// Resource fetching
//
// The one path every component uses to pull a remote resource: resolve the
// reference, obtain the pooled client, read through the cache. Concurrent
// fetches for the same cache key attach to a single in-flight future, so a
// resource is read at most once per fetch wave.

use crate::cache::{cache_key, ResourceCache};
use crate::error::{FederationError, Result};
use crate::metrics::MetricsCollector;
use crate::pool::ConnectionPool;
use crate::protocol::ResourcePayload;
use crate::registry::{ResolvedRef, ResourceRegistry};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;

type FetchFuture = Shared<BoxFuture<'static, Result<ResourcePayload>>>;

/// Cache-aware, deduplicating resource fetcher.
pub struct ResourceFetcher {
    registry: Arc<ResourceRegistry>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ResourceCache>,
    cache_ttl: Duration,
    inflight: Arc<DashMap<String, FetchFuture>>,
    metrics: parking_lot::RwLock<Option<Arc<MetricsCollector>>>,
}

impl ResourceFetcher {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        pool: Arc<ConnectionPool>,
        cache: Arc<ResourceCache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            cache,
            cache_ttl,
            inflight: Arc::new(DashMap::new()),
            metrics: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_metrics(&self, metrics: Arc<MetricsCollector>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Fetch a federated URI through the cache.
    pub async fn fetch_uri(&self, uri: &str) -> Result<ResourcePayload> {
        let resolved = self.registry.resolve(uri)?;
        self.fetch(&resolved).await
    }

    /// Fetch the relative form: explicit alias plus remote URI.
    pub async fn fetch_relative(&self, alias: &str, remote_uri: &str) -> Result<ResourcePayload> {
        let resolved = self.registry.resolve_relative(alias, remote_uri)?;
        self.fetch(&resolved).await
    }

    /// Fetch a resolved reference, serving from cache when fresh.
    pub async fn fetch(&self, resolved: &ResolvedRef) -> Result<ResourcePayload> {
        let key = cache_key(&resolved.reference.alias, &resolved.reference.remote_uri);

        if let Some(payload) = self.cache.get_fresh(&key) {
            self.record_cache_sample();
            return Ok(payload);
        }

        let fetch = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| {
                Self::fetch_task(
                    key.clone(),
                    resolved.reference.alias.clone(),
                    resolved.reference.remote_uri.clone(),
                    resolved.reference.mime_hint.clone(),
                    resolved.server_url.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.pool),
                    Arc::clone(&self.cache),
                    self.cache_ttl,
                    Arc::clone(&self.inflight),
                )
                .boxed()
                .shared()
            })
            .clone();

        let result = fetch.await;
        self.record_cache_sample();
        result
    }

    /// Fetch bypassing the cache; the entry for the key is replaced by the
    /// new payload. Used by virtual-table refresh.
    pub async fn fetch_fresh(&self, resolved: &ResolvedRef) -> Result<ResourcePayload> {
        let key = cache_key(&resolved.reference.alias, &resolved.reference.remote_uri);
        let payload = Self::read_remote(
            &resolved.reference.alias,
            &resolved.reference.remote_uri,
            resolved.reference.mime_hint.as_deref(),
            &resolved.server_url,
            &self.registry,
            &self.pool,
        )
        .await?;

        self.cache.invalidate(&key);
        if payload.cacheable() {
            self.cache.put(&key, payload.clone(), self.cache_ttl);
        }
        Ok(payload)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_task(
        key: String,
        alias: String,
        remote_uri: String,
        mime_hint: Option<String>,
        server_url: String,
        registry: Arc<ResourceRegistry>,
        pool: Arc<ConnectionPool>,
        cache: Arc<ResourceCache>,
        cache_ttl: Duration,
        inflight: Arc<DashMap<String, FetchFuture>>,
    ) -> Result<ResourcePayload> {
        let result = Self::read_remote(
            &alias,
            &remote_uri,
            mime_hint.as_deref(),
            &server_url,
            &registry,
            &pool,
        )
        .await;

        if let Ok(payload) = &result {
            if payload.cacheable() {
                cache.put(&key, payload.clone(), cache_ttl);
            }
        }
        inflight.remove(&key);
        result
    }

    async fn read_remote(
        alias: &str,
        remote_uri: &str,
        mime_hint: Option<&str>,
        server_url: &str,
        registry: &Arc<ResourceRegistry>,
        pool: &Arc<ConnectionPool>,
    ) -> Result<ResourcePayload> {
        let client = pool
            .get(server_url, None)
            .await
            .map_err(|e| FederationError::fetch_failed(alias, remote_uri, e))?;

        // A reconnect produced a new client; keep the descriptor in step.
        if !registry
            .client(alias)
            .map(|existing| Arc::ptr_eq(&existing, &client))
            .unwrap_or(false)
        {
            registry.update_client(alias, Arc::clone(&client));
        }

        client
            .read_resource(remote_uri, mime_hint)
            .await
            .map_err(|e| match e {
                already @ FederationError::FetchFailed { .. } => already,
                other => FederationError::fetch_failed(alias, remote_uri, other),
            })
    }

    fn record_cache_sample(&self) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            let stats = self.cache.stats();
            metrics.record_cache(stats.hits, stats.misses, stats.entries);
        }
    }
}
