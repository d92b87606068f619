// Resource registry
//
// Namespaces attached servers by alias and resolves federated references.
// The federated surface form is `mcp://alias/remoteUri`: the first `/`
// after the scheme separates the alias from the remote URI, the alias must
// not contain `/`, and the remote URI is taken verbatim (it may carry its
// own scheme, e.g. `test://foo`).

use crate::error::{FederationError, Result};
use crate::protocol::ProtocolClient;
pub use crate::protocol::{RemoteResource, RemoteTool};
use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A parsed federated reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub alias: String,
    pub remote_uri: String,
    pub mime_hint: Option<String>,
}

impl ResourceRef {
    /// The canonical surface form.
    pub fn federated_uri(&self, prefix: &str) -> String {
        format!("{}{}/{}", prefix, self.alias, self.remote_uri)
    }
}

/// Descriptor for one attached server.
pub struct ServerDescriptor {
    pub alias: String,
    pub url: String,
    pub transport: TransportKind,
    pub client: Arc<ProtocolClient>,
    pub resources: Vec<RemoteResource>,
    pub tools: Vec<RemoteTool>,
    pub last_refresh: DateTime<Utc>,
    /// Opaque caller-supplied metadata carried on the descriptor.
    pub meta: Option<serde_json::Value>,
}

/// Serializable view of a descriptor for stats output.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub alias: String,
    pub url: String,
    pub transport: TransportKind,
    pub resource_count: usize,
    pub tool_count: usize,
    pub last_refresh: DateTime<Utc>,
}

/// A resource flattened across servers, addressable from SQL.
#[derive(Debug, Clone, Serialize)]
pub struct FederatedResource {
    pub server_alias: String,
    pub full_uri: String,

    #[serde(flatten)]
    pub resource: RemoteResource,
}

/// A tool flattened across servers.
#[derive(Debug, Clone, Serialize)]
pub struct FederatedTool {
    pub server_alias: String,

    #[serde(flatten)]
    pub tool: RemoteTool,
}

/// A reference resolved against the registry.
#[derive(Debug)]
pub struct ResolvedRef {
    pub reference: ResourceRef,
    pub client: Arc<ProtocolClient>,
    pub server_url: String,
}

/// Alias to server descriptor map.
pub struct ResourceRegistry {
    namespace_prefix: String,
    servers: RwLock<HashMap<String, ServerDescriptor>>,
}

impl ResourceRegistry {
    pub fn new(namespace_prefix: &str) -> Self {
        Self {
            namespace_prefix: namespace_prefix.to_string(),
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.namespace_prefix
    }

    /// Split a federated URI into `(alias, remote_uri)`.
    pub fn parse_federated(&self, uri: &str) -> Result<(String, String)> {
        let rest = uri.strip_prefix(&self.namespace_prefix).ok_or_else(|| {
            FederationError::ReferenceUnresolved(format!(
                "{} does not start with {}",
                uri, self.namespace_prefix
            ))
        })?;
        let (alias, remote) = rest.split_once('/').ok_or_else(|| {
            FederationError::ReferenceUnresolved(format!("{} has no resource path", uri))
        })?;
        if alias.is_empty() {
            return Err(FederationError::ReferenceUnresolved(format!(
                "{} has an empty alias",
                uri
            )));
        }
        if remote.is_empty() {
            return Err(FederationError::ReferenceUnresolved(format!(
                "{} has an empty resource path",
                uri
            )));
        }
        Ok((alias.to_string(), remote.to_string()))
    }

    /// Register a descriptor. Fails without mutating state when the alias
    /// is already taken.
    pub fn register(&self, descriptor: ServerDescriptor) -> Result<()> {
        let mut servers = self.servers.write();
        if servers.contains_key(&descriptor.alias) {
            return Err(FederationError::Config(format!(
                "alias {} is already registered",
                descriptor.alias
            )));
        }
        tracing::info!(
            "registered server {} at {} via {}",
            descriptor.alias,
            descriptor.url,
            descriptor.transport
        );
        servers.insert(descriptor.alias.clone(), descriptor);
        Ok(())
    }

    /// Remove and return a descriptor.
    pub fn unregister(&self, alias: &str) -> Result<ServerDescriptor> {
        self.servers.write().remove(alias).ok_or_else(|| {
            FederationError::ReferenceUnresolved(format!("no server registered as {}", alias))
        })
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.servers.read().contains_key(alias)
    }

    /// Resolve a federated URI to its reference and client.
    pub fn resolve(&self, uri: &str) -> Result<ResolvedRef> {
        let (alias, remote_uri) = self.parse_federated(uri)?;
        self.resolve_relative(&alias, &remote_uri)
    }

    /// Resolve the relative form: an explicit alias plus a remote URI.
    pub fn resolve_relative(&self, alias: &str, remote_uri: &str) -> Result<ResolvedRef> {
        let servers = self.servers.read();
        let descriptor = servers.get(alias).ok_or_else(|| {
            FederationError::ReferenceUnresolved(format!("no server registered as {}", alias))
        })?;
        let mime_hint = descriptor
            .resources
            .iter()
            .find(|r| r.uri == remote_uri)
            .and_then(|r| r.mime_type.clone());
        Ok(ResolvedRef {
            reference: ResourceRef {
                alias: alias.to_string(),
                remote_uri: remote_uri.to_string(),
                mime_hint,
            },
            client: Arc::clone(&descriptor.client),
            server_url: descriptor.url.clone(),
        })
    }

    /// Client handle for an alias.
    pub fn client(&self, alias: &str) -> Result<Arc<ProtocolClient>> {
        let servers = self.servers.read();
        servers
            .get(alias)
            .map(|d| Arc::clone(&d.client))
            .ok_or_else(|| {
                FederationError::ReferenceUnresolved(format!("no server registered as {}", alias))
            })
    }

    /// Canonical URL for an alias.
    pub fn server_url(&self, alias: &str) -> Option<String> {
        self.servers.read().get(alias).map(|d| d.url.clone())
    }

    /// Aliases whose descriptor points at the given URL.
    pub fn aliases_for_url(&self, url: &str) -> Vec<String> {
        self.servers
            .read()
            .values()
            .filter(|d| d.url == url)
            .map(|d| d.alias.clone())
            .collect()
    }

    /// Flatten every server's resource listing.
    pub fn list_all(&self) -> Vec<FederatedResource> {
        let servers = self.servers.read();
        let mut all = Vec::new();
        for descriptor in servers.values() {
            for resource in &descriptor.resources {
                all.push(FederatedResource {
                    server_alias: descriptor.alias.clone(),
                    full_uri: format!(
                        "{}{}/{}",
                        self.namespace_prefix, descriptor.alias, resource.uri
                    ),
                    resource: resource.clone(),
                });
            }
        }
        all
    }

    /// Flatten every server's tool listing.
    pub fn list_tools(&self) -> Vec<FederatedTool> {
        let servers = self.servers.read();
        let mut all = Vec::new();
        for descriptor in servers.values() {
            for tool in &descriptor.tools {
                all.push(FederatedTool {
                    server_alias: descriptor.alias.clone(),
                    tool: tool.clone(),
                });
            }
        }
        all
    }

    /// Swap the live client for an alias after a pool reconnect.
    pub fn update_client(&self, alias: &str, client: Arc<ProtocolClient>) {
        if let Some(descriptor) = self.servers.write().get_mut(alias) {
            descriptor.client = client;
        }
    }

    /// Re-fetch a server's listings and swap them in atomically.
    pub async fn refresh_listing(&self, alias: &str) -> Result<()> {
        let client = self.client(alias)?;
        let resources = client.list_resources().await?;
        let tools = client.list_tools().await?;

        let mut servers = self.servers.write();
        let descriptor = servers.get_mut(alias).ok_or_else(|| {
            FederationError::ReferenceUnresolved(format!("no server registered as {}", alias))
        })?;
        descriptor.resources = resources;
        descriptor.tools = tools;
        descriptor.last_refresh = Utc::now();
        Ok(())
    }

    pub fn summaries(&self) -> Vec<ServerSummary> {
        self.servers
            .read()
            .values()
            .map(|d| ServerSummary {
                alias: d.alias.clone(),
                url: d.url.clone(),
                transport: d.transport,
                resource_count: d.resources.len(),
                tool_count: d.tools.len(),
                last_refresh: d.last_refresh,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
