// Federation broker
//
// The public facade. Owns every federation component and wires them
// together; callers attach servers, run federated SQL, and manage virtual
// tables exclusively through this type.

use crate::cache::{alias_prefix, CacheStats, ResourceCache};
use crate::config::{BrokerConfig, VirtualTableConfig};
use crate::engine::{Engine, Row};
use crate::error::{FederationError, Result};
use crate::fetch::ResourceFetcher;
use crate::mapper::{MappedTable, ResourceMapper};
use crate::metrics::MetricsCollector;
use crate::pool::{ConnectionPool, ForceResetOptions, PoolStats};
use crate::registry::{
    FederatedResource, FederatedTool, ResourceRegistry, ServerDescriptor, ServerSummary,
};
use crate::router::{QueryPlan, QueryRouter};
use crate::transport::TransportKind;
use crate::vtable::{VirtualTableInfo, VirtualTableManager};
use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;

static GLOBAL: OnceCell<Arc<FederationBroker>> = OnceCell::new();

/// Aggregated broker snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub servers: Vec<ServerSummary>,
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub virtual_tables: Vec<VirtualTableInfo>,
    pub mapped_tables: Vec<MappedTable>,
}

/// Top-level query federation broker.
pub struct FederationBroker {
    config: BrokerConfig,
    engine: Arc<dyn Engine>,
    registry: Arc<ResourceRegistry>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ResourceCache>,
    fetcher: Arc<ResourceFetcher>,
    mapper: Arc<ResourceMapper>,
    vtables: Arc<VirtualTableManager>,
    router: QueryRouter,
    metrics: Arc<MetricsCollector>,
}

impl FederationBroker {
    /// Build a broker over an engine handle.
    pub fn new(config: BrokerConfig, engine: Arc<dyn Engine>) -> Result<Arc<Self>> {
        config.validate()?;

        let registry = Arc::new(ResourceRegistry::new(
            &config.federation.registry.namespace_prefix,
        ));
        let pool = Arc::new(ConnectionPool::new(config.federation.pool.clone()));
        let cache = Arc::new(ResourceCache::new(
            config.federation.registry.cache_enabled,
            config.federation.registry.cache_max_entries,
        ));
        let fetcher = Arc::new(ResourceFetcher::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&cache),
            config.federation.registry.cache_ttl(),
        ));
        let mapper = Arc::new(ResourceMapper::new(Arc::clone(&engine)));
        let vtables = VirtualTableManager::new(
            Arc::clone(&engine),
            Arc::clone(&mapper),
            Arc::clone(&fetcher),
            Arc::clone(&registry),
        );
        let router = QueryRouter::new(
            config.federation.router.clone(),
            Arc::clone(&engine),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            Arc::clone(&mapper),
            Arc::clone(&vtables),
        );

        let metrics = MetricsCollector::new(config.metrics.clone());
        metrics.start();
        pool.set_metrics(Arc::clone(&metrics));
        fetcher.set_metrics(Arc::clone(&metrics));
        router.set_metrics(Arc::clone(&metrics));

        Ok(Arc::new(Self {
            config,
            engine,
            registry,
            pool,
            cache,
            fetcher,
            mapper,
            vtables,
            router,
            metrics,
        }))
    }

    /// Initialise the process-wide broker exactly once. A failed
    /// initialisation leaves the slot empty for a later retry.
    pub fn initialize_global(config: BrokerConfig, engine: Arc<dyn Engine>) -> Result<Arc<Self>> {
        GLOBAL
            .get_or_try_init(|| Self::new(config, engine))
            .cloned()
    }

    /// The process-wide broker, if initialised.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Server lifecycle
    // ------------------------------------------------------------------

    /// Attach a server under a unique alias: connect (negotiating the
    /// transport when none is given), pull initial listings, register.
    pub async fn attach_server(
        &self,
        url: &str,
        alias: &str,
        transport: Option<TransportKind>,
        meta: Option<serde_json::Value>,
    ) -> Result<ServerSummary> {
        if alias.is_empty() || alias.contains('/') {
            return Err(FederationError::Config(format!(
                "invalid alias {:?}: must be non-empty and must not contain '/'",
                alias
            )));
        }
        if self.registry.contains(alias) {
            return Err(FederationError::Config(format!(
                "alias {} is already registered",
                alias
            )));
        }

        let client = self.pool.get(url, transport).await?;

        let resources = match client.list_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::warn!("resource listing for {} failed: {}", alias, e);
                Vec::new()
            }
        };
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("tool listing for {} failed: {}", alias, e);
                Vec::new()
            }
        };

        let descriptor = ServerDescriptor {
            alias: alias.to_string(),
            url: url.to_string(),
            transport: client.transport_kind(),
            client,
            resources,
            tools,
            last_refresh: Utc::now(),
            meta,
        };
        self.registry.register(descriptor)?;

        let summary = self
            .registry
            .summaries()
            .into_iter()
            .find(|s| s.alias == alias)
            .ok_or_else(|| FederationError::Invariant(format!("{} vanished after register", alias)))?;
        Ok(summary)
    }

    /// Detach a server: unregister, close its client unless another alias
    /// shares the connection, and purge its cache entries. A second detach
    /// for the same alias fails with `ReferenceUnresolved`.
    pub async fn detach_server(&self, alias: &str) -> Result<()> {
        let descriptor = self.registry.unregister(alias)?;

        // The pooled connection may be shared by other aliases on the same
        // URL; only close it when this was the last one.
        if self.registry.aliases_for_url(&descriptor.url).is_empty() {
            if let Err(e) = self.pool.reset(&descriptor.url).await {
                tracing::warn!("pool reset during detach of {} failed: {}", alias, e);
            }
            if let Err(e) = descriptor.client.close().await {
                tracing::warn!("client close during detach of {} failed: {}", alias, e);
            }
        }

        let purged = self.cache.invalidate_prefix(&alias_prefix(alias));
        tracing::info!("detached {} ({} cache entries purged)", alias, purged);
        Ok(())
    }

    /// Forcibly reset a server's connection and purge its cache entries.
    pub async fn force_reset_server(&self, alias: &str, opts: ForceResetOptions) -> Result<()> {
        let url = self.registry.server_url(alias).ok_or_else(|| {
            FederationError::ReferenceUnresolved(format!("no server registered as {}", alias))
        })?;
        self.pool.force_reset(&url, opts).await?;
        self.cache.invalidate_prefix(&alias_prefix(alias));
        Ok(())
    }

    /// Re-pull a server's resource and tool listings.
    pub async fn refresh_listing(&self, alias: &str) -> Result<()> {
        self.registry.refresh_listing(alias).await
    }

    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.registry.summaries()
    }

    pub fn list_resources(&self) -> Vec<FederatedResource> {
        self.registry.list_all()
    }

    pub fn list_tools(&self) -> Vec<FederatedTool> {
        self.registry.list_tools()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Execute SQL that may reference `mcp://` resources.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.router.query(sql).await
    }

    /// Plan a federated query without contacting any server.
    pub fn analyze(&self, sql: &str) -> Result<QueryPlan> {
        self.router.analyze(sql)
    }

    /// Alias of `analyze` kept for callers that speak EXPLAIN.
    pub fn explain(&self, sql: &str) -> Result<QueryPlan> {
        self.router.analyze(sql)
    }

    /// Invoke a tool on an attached server.
    pub async fn call_tool(
        &self,
        alias: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let client = self.registry.client(alias)?;
        client.call_tool(tool_name, args).await
    }

    // ------------------------------------------------------------------
    // Virtual tables
    // ------------------------------------------------------------------

    pub async fn create_virtual_table(
        &self,
        name: &str,
        uri: &str,
        alias: Option<&str>,
        config: VirtualTableConfig,
    ) -> Result<VirtualTableInfo> {
        self.vtables.create_virtual_table(name, uri, alias, config).await
    }

    pub async fn load_virtual_table(&self, name: &str) -> Result<()> {
        self.vtables.load_virtual_table(name).await
    }

    pub async fn refresh_virtual_table(&self, name: &str) -> Result<bool> {
        self.vtables.refresh_virtual_table(name).await
    }

    pub async fn drop_virtual_table(&self, name: &str) -> Result<()> {
        self.vtables.drop_virtual_table(name).await
    }

    pub async fn update_virtual_table_config(
        &self,
        name: &str,
        config: VirtualTableConfig,
    ) -> Result<()> {
        self.vtables.update_config(name, config).await
    }

    pub async fn materialize_virtual_table(
        &self,
        virtual_name: &str,
        snapshot_name: &str,
    ) -> Result<()> {
        self.vtables.materialize(virtual_name, snapshot_name).await
    }

    pub fn list_virtual_tables(&self) -> Vec<VirtualTableInfo> {
        self.vtables.list()
    }

    // ------------------------------------------------------------------
    // Cache and stats
    // ------------------------------------------------------------------

    /// Clear cached payloads, for one alias or everything.
    pub fn clear_cache(&self, alias: Option<&str>) {
        match alias {
            Some(alias) => {
                self.cache.invalidate_prefix(&alias_prefix(alias));
            }
            None => self.cache.clear(),
        }
    }

    /// Aggregate snapshot of pool, cache, registry, and virtual tables.
    pub fn stats(&self) -> BrokerStats {
        self.metrics.record_memory();
        BrokerStats {
            servers: self.registry.summaries(),
            pool: self.pool.stats(),
            cache: self.cache.stats(),
            virtual_tables: self.vtables.list(),
            mapped_tables: self.mapper.list(),
        }
    }

    /// Fetch one federated resource through the cache without
    /// materialising it.
    pub async fn read_resource(&self, uri: &str) -> Result<crate::protocol::ResourcePayload> {
        self.fetcher.fetch_uri(uri).await
    }

    /// Direct engine access for callers that manage their own tables.
    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    /// Orderly shutdown: drop virtual tables, close connections, flush
    /// metrics. Secondary errors are logged, never surfaced.
    pub async fn shutdown(&self) {
        self.vtables.drop_all().await;
        self.pool.reset_all().await;
        self.metrics.shutdown();
        tracing::info!("federation broker shut down");
    }
}
