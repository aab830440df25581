//! Relay: virtual MCP server gateway.
//! Presents remote, locally spawned and repo-backed providers as named,
//! key-protected virtual servers: aggregates their capabilities, starts local
//! providers on demand, and forwards calls with end-to-end deadlines.

pub mod aggregator;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod error;
pub mod gateway;
pub mod namespace;
pub mod plugin;
pub mod repo;
pub mod router;
pub mod server;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use aggregator::{Aggregator, Listing};
pub use auth::{AuthGuard, EnvSecretStore, SecretStore, StaticSecretStore};
pub use catalog::{
    CapabilityRef, Catalog, CatalogDocument, CatalogStore, EntryKind, FileStore, MemoryStore,
    ProviderTransport, RegistryEntry, VirtualServer,
};
pub use config::{RelayConfig, parse_env_ref, resolve_env_vars};
pub use connector::ProviderConnector;
pub use error::{RelayError, Result};
pub use gateway::{Gateway, GatewayHealth, reload_catalog, run_catalog_reload};
pub use plugin::{PluginHostServer, PluginSet, run_hot_reload};
pub use router::{JsonRpcResponse, Router};
pub use supervisor::{Endpoint, ProcessState, ReadinessProbe, Supervisor, TcpProbe};
