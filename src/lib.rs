// mcp-federation - Query federation broker for embedded analytical SQL engines
// Core library module

pub mod broker;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod mapper;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod transport;
pub mod vtable;

pub use broker::{BrokerStats, FederationBroker};
pub use config::BrokerConfig;
pub use engine::{ColumnInfo, Engine, FileFormat, Row, TableInfo};
pub use error::{FederationError, Result};
pub use protocol::payload::ResourcePayload;
pub use registry::{RemoteResource, RemoteTool, ResourceRef};
pub use transport::TransportKind;
