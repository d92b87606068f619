// Query router
//
// Detects `mcp://alias/path` references inside SQL, materialises each
// distinct reference into a collision-free temp table, rewrites the SQL to
// point at those tables, and executes the result on the engine. Quoted
// references are replaced including their quotes so the engine sees a
// plain identifier. Temp tables are dropped best-effort afterwards, on
// success, failure, and cancellation alike.

use crate::cache::{cache_key, ResourceCache};
use crate::config::RouterConfig;
use crate::engine::{Engine, Row};
use crate::error::{FederationError, Result};
use crate::fetch::ResourceFetcher;
use crate::mapper::ResourceMapper;
use crate::metrics::MetricsCollector;
use crate::registry::{ResolvedRef, ResourceRegistry};
use crate::vtable::VirtualTableManager;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Matches a federated reference: single-quoted, double-quoted, or bare.
/// A bare path runs until the next SQL token boundary.
static REFERENCE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"'(mcp://[^']+)'|"(mcp://[^"]+)"|(mcp://[^\s,;)'"]+)"#)
        .expect("reference pattern must compile")
});

/// One reference found during analysis.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedReference {
    pub uri: String,
    pub alias: String,
    pub remote_uri: String,
    pub cached: bool,
}

/// Result of `analyze`: the references a query would touch and the servers
/// it would contact. Produced without opening any connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub sql: String,
    pub references: Vec<PlannedReference>,
    pub servers: Vec<String>,
}

/// Federated SQL router.
pub struct QueryRouter {
    config: RouterConfig,
    engine: Arc<dyn Engine>,
    registry: Arc<ResourceRegistry>,
    cache: Arc<ResourceCache>,
    fetcher: Arc<ResourceFetcher>,
    mapper: Arc<ResourceMapper>,
    vtables: Arc<VirtualTableManager>,
    metrics: parking_lot::RwLock<Option<Arc<MetricsCollector>>>,
}

impl QueryRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        engine: Arc<dyn Engine>,
        registry: Arc<ResourceRegistry>,
        cache: Arc<ResourceCache>,
        fetcher: Arc<ResourceFetcher>,
        mapper: Arc<ResourceMapper>,
        vtables: Arc<VirtualTableManager>,
    ) -> Self {
        Self {
            config,
            engine,
            registry,
            cache,
            fetcher,
            mapper,
            vtables,
            metrics: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_metrics(&self, metrics: Arc<MetricsCollector>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Distinct federated URIs referenced by `sql`, in first-seen order.
    pub fn scan(&self, sql: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for captures in REFERENCE_PATTERN.captures_iter(sql) {
            let uri = captures
                .get(1)
                .or_else(|| captures.get(2))
                .or_else(|| captures.get(3))
                .map(|m| m.as_str().to_string());
            if let Some(uri) = uri {
                if !seen.contains(&uri) {
                    seen.push(uri);
                }
            }
        }
        seen
    }

    /// Steps 1-2 only: scan and resolve, never connect.
    pub fn analyze(&self, sql: &str) -> Result<QueryPlan> {
        let mut references = Vec::new();
        let mut servers = Vec::new();
        for uri in self.scan(sql) {
            let (alias, remote_uri) = self.registry.parse_federated(&uri)?;
            if !self.registry.contains(&alias) {
                return Err(FederationError::ReferenceUnresolved(format!(
                    "no server registered as {}",
                    alias
                )));
            }
            let cached = self.cache.contains_fresh(&cache_key(&alias, &remote_uri));
            if !servers.contains(&alias) {
                servers.push(alias.clone());
            }
            references.push(PlannedReference {
                uri,
                alias,
                remote_uri,
                cached,
            });
        }
        Ok(QueryPlan {
            sql: sql.to_string(),
            references,
            servers,
        })
    }

    /// Execute `sql`, transparently materialising every federated
    /// reference it names.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let started = Instant::now();
        let result = self.query_inner(sql).await;
        let elapsed = started.elapsed();

        if let Some(metrics) = self.metrics.read().as_ref() {
            let row_count = result.as_ref().map(|rows| rows.len()).unwrap_or(0);
            metrics.record_query(sql, elapsed, row_count);
        }
        result
    }

    async fn query_inner(&self, sql: &str) -> Result<Vec<Row>> {
        // Force-load lazy virtual tables referenced by name.
        self.vtables.ensure_loaded_for(sql).await?;

        let uris = self.scan(sql);
        if uris.is_empty() {
            return self
                .engine
                .execute(sql)
                .await
                .map_err(|e| FederationError::ExecuteFailed(e.to_string()));
        }

        let mut resolved: Vec<(String, ResolvedRef)> = Vec::with_capacity(uris.len());
        for uri in &uris {
            resolved.push((uri.clone(), self.registry.resolve(uri)?));
        }

        let mut guard = TempTableGuard::new(Arc::clone(&self.mapper));
        let outcome = tokio::time::timeout(
            self.config.query_timeout(),
            self.materialize_and_execute(sql, resolved, &mut guard),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(FederationError::Timeout(format!(
                "federated query exceeded {:?}",
                self.config.query_timeout()
            ))),
        };

        // Deferred cleanup; never masks the primary outcome.
        guard.cleanup().await;
        result
    }

    async fn materialize_and_execute(
        &self,
        sql: &str,
        resolved: Vec<(String, ResolvedRef)>,
        guard: &mut TempTableGuard,
    ) -> Result<Vec<Row>> {
        // Fetch each distinct reference, in parallel up to the configured
        // width. The first failure cancels the remaining fetches.
        let width = if self.config.parallel_queries {
            self.config.max_parallel_queries
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(width));

        let fetches = resolved.iter().map(|(uri, reference)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| FederationError::Invariant("fetch semaphore closed".to_string()))?;
                let payload = self.fetcher.fetch(reference).await?;
                Ok::<_, FederationError>((uri.clone(), payload))
            }
        });
        let payloads = futures_util::future::try_join_all(fetches).await?;

        // Materialise each payload into a fresh temp table.
        let mut substitutions: HashMap<String, String> = HashMap::new();
        for (uri, payload) in payloads {
            let temp_name = self.temp_table_name();
            self.mapper.map(&payload, &temp_name, &uri).await?;
            guard.track(temp_name.clone());
            substitutions.insert(uri, temp_name);
        }

        let rewritten = rewrite_sql(sql, &substitutions);
        tracing::debug!("rewrote federated query: {}", rewritten);

        self.engine
            .execute(&rewritten)
            .await
            .map_err(|e| FederationError::ExecuteFailed(e.to_string()))
    }

    fn temp_table_name(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.config.temp_table_prefix, &suffix[..12])
    }
}

/// Substitute every occurrence of each federated token (quotes included)
/// with its temp table identifier.
fn rewrite_sql(sql: &str, substitutions: &HashMap<String, String>) -> String {
    REFERENCE_PATTERN
        .replace_all(sql, |captures: &regex::Captures<'_>| {
            let uri = captures
                .get(1)
                .or_else(|| captures.get(2))
                .or_else(|| captures.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match substitutions.get(uri) {
                Some(temp_name) => temp_name.clone(),
                None => captures.get(0).map(|m| m.as_str()).unwrap_or_default().to_string(),
            }
        })
        .to_string()
}

/// Tracks materialised temp tables and unmaps them on every exit path. If
/// the owning future is cancelled, the unmap happens on a detached task.
struct TempTableGuard {
    mapper: Arc<ResourceMapper>,
    tables: Vec<String>,
}

impl TempTableGuard {
    fn new(mapper: Arc<ResourceMapper>) -> Self {
        Self {
            mapper,
            tables: Vec::new(),
        }
    }

    fn track(&mut self, name: String) {
        self.tables.push(name);
    }

    async fn cleanup(&mut self) {
        for name in std::mem::take(&mut self.tables) {
            if let Err(e) = self.mapper.unmap(&name).await {
                tracing::warn!("failed to drop temp table {}: {}", name, e);
            }
        }
    }
}

impl Drop for TempTableGuard {
    fn drop(&mut self) {
        if self.tables.is_empty() {
            return;
        }
        let mapper = Arc::clone(&self.mapper);
        let tables = std::mem::take(&mut self.tables);
        tokio::spawn(async move {
            for name in tables {
                if let Err(e) = mapper.unmap(&name).await {
                    tracing::warn!("failed to drop temp table {}: {}", name, e);
                }
            }
        });
    }
}
