//! Uniform client for one downstream provider, whatever its kind.
//!
//! Local and repo entries are started through the [`Supervisor`] first; remote
//! entries are contacted directly. The caller's deadline covers the whole
//! operation including process startup.

pub mod jsonrpc;
pub mod mcp;

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::auth::AuthGuard;
use crate::catalog::{Connection, ProviderCapabilities, ProviderTransport, RegistryEntry};
use crate::error::RelayError;
use crate::supervisor::{Lease, Supervisor};

/// Resolved address of a provider for one operation.
struct Target {
    url: String,
    transport: ProviderTransport,
    credential: Option<String>,
    // Keeps the process from being reaped while the operation runs.
    _lease: Option<Lease>,
}

/// Talks to providers over MCP or bare JSON-RPC, starting supervised ones on
/// demand. Cheap to clone; clones share the HTTP client and supervisor.
#[derive(Clone)]
pub struct ProviderConnector {
    supervisor: Supervisor,
    auth: AuthGuard,
    http: reqwest::Client,
}

impl ProviderConnector {
    /// Outbound credentials come from `auth`; local and repo entries are
    /// started through `supervisor`.
    pub fn new(supervisor: Supervisor, auth: AuthGuard) -> Self {
        Self {
            supervisor,
            auth,
            http: reqwest::Client::new(),
        }
    }

    /// The supervisor that owns this connector's local processes.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    async fn resolve(&self, entry: &RegistryEntry) -> crate::Result<Target> {
        let credential = self.auth.outbound_credential_for(&entry.id);
        match entry.connection()? {
            Connection::Remote(remote) => Ok(Target {
                url: remote.url.clone(),
                transport: remote.transport,
                credential,
                _lease: None,
            }),
            Connection::Local(local) => {
                let lease = self.supervisor.ensure_running(entry).await?;
                Ok(Target {
                    url: lease.endpoint().base_url(&local.path),
                    transport: local.transport,
                    credential,
                    _lease: Some(lease),
                })
            }
            Connection::Repo(repo) => {
                let lease = self.supervisor.ensure_running(entry).await?;
                Ok(Target {
                    url: lease.endpoint().base_url(&repo.launch.path),
                    transport: repo.launch.transport,
                    credential,
                    _lease: Some(lease),
                })
            }
        }
    }

    /// Bound `operation` by `deadline`, process startup included.
    async fn within<T>(
        &self,
        entry: &RegistryEntry,
        deadline: Duration,
        operation: impl Future<Output = crate::Result<T>>,
    ) -> crate::Result<T> {
        match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ToolTimeout(
                entry.id.clone(),
                deadline.as_millis() as u64,
            )),
        }
    }

    /// Fetch the provider's tools and prompts.
    pub async fn list_capabilities(
        &self,
        entry: &RegistryEntry,
        deadline: Duration,
    ) -> crate::Result<ProviderCapabilities> {
        self.within(entry, deadline, async {
            let target = self.resolve(entry).await?;
            let credential = target.credential.as_deref();
            match target.transport {
                ProviderTransport::Mcp => {
                    mcp::list_capabilities(&entry.id, &target.url, credential).await
                }
                ProviderTransport::Jsonrpc => {
                    jsonrpc::list_capabilities(&self.http, &entry.id, &target.url, credential)
                        .await
                }
            }
        })
        .await
    }

    /// Call one tool; the provider's result payload is returned as-is.
    pub async fn invoke(
        &self,
        entry: &RegistryEntry,
        tool: &str,
        params: Map<String, Value>,
        deadline: Duration,
    ) -> crate::Result<Value> {
        tracing::debug!(entry = %entry.id, tool = %tool, "invoking provider tool");
        self.within(entry, deadline, async {
            let target = self.resolve(entry).await?;
            let credential = target.credential.as_deref();
            match target.transport {
                ProviderTransport::Mcp => {
                    mcp::call_tool(&entry.id, &target.url, credential, tool, params).await
                }
                ProviderTransport::Jsonrpc => {
                    jsonrpc::call_tool(
                        &self.http,
                        &entry.id,
                        &target.url,
                        credential,
                        tool,
                        params,
                    )
                    .await
                }
            }
        })
        .await
    }

    /// Render one of the provider's prompts with `arguments`.
    ///
    /// Fails with `ToolTimeout` when the deadline passes, with the provider's
    /// own error kind otherwise.
    pub async fn get_prompt(
        &self,
        entry: &RegistryEntry,
        prompt: &str,
        arguments: Map<String, Value>,
        deadline: Duration,
    ) -> crate::Result<Value> {
        self.within(entry, deadline, async {
            let target = self.resolve(entry).await?;
            let credential = target.credential.as_deref();
            match target.transport {
                ProviderTransport::Mcp => {
                    mcp::get_prompt(&entry.id, &target.url, credential, prompt, arguments).await
                }
                ProviderTransport::Jsonrpc => {
                    jsonrpc::get_prompt(
                        &self.http,
                        &entry.id,
                        &target.url,
                        credential,
                        prompt,
                        arguments,
                    )
                    .await
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSecretStore;
    use crate::catalog::{Catalog, CatalogDocument};
    use crate::config::SupervisorConfig;
    use crate::test_support::{dead_url, spawn_provider};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn connector(secrets: HashMap<String, String>) -> ProviderConnector {
        let catalog = Catalog::in_memory(CatalogDocument::default());
        let auth = AuthGuard::new(catalog, Arc::new(StaticSecretStore(secrets)));
        let supervisor = Supervisor::with_tcp_probe(SupervisorConfig {
            port_range_start: 47200,
            port_range_end: 47209,
            ..SupervisorConfig::default()
        });
        ProviderConnector::new(supervisor, auth)
    }

    fn remote(id: &str, url: String) -> RegistryEntry {
        RegistryEntry::remote(id, url, ProviderTransport::Jsonrpc)
    }

    #[tokio::test]
    async fn test_list_capabilities_over_jsonrpc() {
        let provider = spawn_provider(&["scan", "lookup"], Duration::ZERO).await;
        let caps = connector(HashMap::new())
            .list_capabilities(&remote("intel", provider.url()), Duration::from_secs(5))
            .await
            .unwrap();
        let names: Vec<_> = caps.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["scan", "lookup"]);
        // prompts/list is answered with method-not-found: treated as none.
        assert!(caps.prompts.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_attaches_bearer_credential() {
        let provider = spawn_provider(&["scan"], Duration::ZERO).await;
        let mut secrets = HashMap::new();
        secrets.insert("intel".to_string(), "upstream-token".to_string());
        let mut params = Map::new();
        params.insert("target".to_string(), Value::from("example.com"));

        let payload = connector(secrets)
            .invoke(
                &remote("intel", provider.url()),
                "scan",
                params,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(payload["tool"], "scan");
        assert_eq!(payload["echo"]["target"], "example.com");
        let seen = provider.auth_seen.lock().await.clone();
        assert_eq!(seen, vec![Some("Bearer upstream-token".to_string())]);
    }

    #[tokio::test]
    async fn test_provider_error_is_upstream() {
        let provider = spawn_provider(&["explode"], Duration::ZERO).await;
        let result = connector(HashMap::new())
            .invoke(
                &remote("intel", provider.url()),
                "explode",
                Map::new(),
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(RelayError::Upstream(_, msg)) if msg == "provider blew up"));
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_tool_timeout() {
        let provider = spawn_provider(&["scan"], Duration::from_millis(500)).await;
        let result = connector(HashMap::new())
            .invoke(
                &remote("slow", provider.url()),
                "scan",
                Map::new(),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(RelayError::ToolTimeout(id, 100)) if id == "slow"));
    }

    #[tokio::test]
    async fn test_dead_provider_is_unreachable() {
        let result = connector(HashMap::new())
            .list_capabilities(&remote("gone", dead_url()), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RelayError::Unreachable(id, _)) if id == "gone"));
    }

    #[tokio::test]
    async fn test_non_json_answer_is_protocol_mismatch() {
        let provider = spawn_provider(&[], Duration::ZERO).await;
        let url = format!("{}/html", provider.base);
        let result = connector(HashMap::new())
            .list_capabilities(&remote("web", url), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RelayError::ProtocolMismatch(..))));
    }
}
