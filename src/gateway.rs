//! Gateway: builds every component from one config and owns their lifetime.
//!
//! Wiring order follows the dependency chain: catalog, secrets, supervisor,
//! auth guard, connector, aggregator, router. The idle reaper runs under a
//! child of the gateway's cancellation token. A file-backed catalog can be
//! watched for external edits with [`run_catalog_reload`].
//!
//! Entry mutations go through the gateway rather than the bare [`Catalog`]:
//! changing or removing a local or repo-backed entry stops its process and
//! drops its checkout marker, so the next call starts from the new definition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::auth::{AuthGuard, EnvSecretStore, SecretStore};
use crate::catalog::{
    Catalog, CatalogDocument, CatalogStore, EntryHealth, EntryKind, EntryPatch, FileStore,
    RegistryEntry,
};
use crate::config::{RelayConfig, parse_env_ref};
use crate::connector::ProviderConnector;
use crate::router::Router;
use crate::supervisor::{ProcessInfo, ReadinessProbe, Supervisor, TcpProbe};

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub id: String,
    pub kind: EntryKind,
    pub health: EntryHealth,
    pub tools: usize,
    pub prompts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub status: &'static str,
    pub version: &'static str,
    pub virtual_servers: usize,
    pub entries: Vec<EntryStatus>,
    pub processes: Vec<ProcessInfo>,
    pub ports_available: usize,
    pub ports_total: usize,
}

pub struct Gateway {
    catalog: Catalog,
    supervisor: Supervisor,
    aggregator: Aggregator,
    router: Router,
    admin_token: Option<String>,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway with environment-backed secrets and the TCP readiness probe.
    pub async fn from_config(config: &RelayConfig, catalog: Catalog) -> crate::Result<Self> {
        let secrets = Arc::new(EnvSecretStore::new(config.secrets.clone()));
        Self::with_parts(config, catalog, secrets, Arc::new(TcpProbe::default())).await
    }

    pub async fn with_parts(
        config: &RelayConfig,
        catalog: Catalog,
        secrets: Arc<dyn SecretStore>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> crate::Result<Self> {
        config.validate()?;
        // Fail fast on a catalog that does not load.
        let doc = catalog.snapshot().await?;

        let supervisor = Supervisor::new(config.supervisor.clone(), probe);
        let auth = AuthGuard::new(catalog.clone(), secrets);
        let connector = ProviderConnector::new(supervisor.clone(), auth.clone());
        let aggregator = Aggregator::new(
            catalog.clone(),
            connector.clone(),
            config.gateway.per_entry_timeout(),
            config.gateway.list_cache_ttl(),
        );
        let router = Router::new(
            catalog.clone(),
            auth,
            aggregator.clone(),
            connector,
            config.gateway.default_deadline(),
        );

        let admin_token = config
            .gateway
            .admin_token
            .as_deref()
            .and_then(parse_env_ref)
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.is_empty());
        if config.gateway.admin_token.is_some() && admin_token.is_none() {
            tracing::warn!("admin token variable is unset or empty, admin API disabled");
        }

        let cancel = CancellationToken::new();
        let reaper = supervisor.spawn_reaper(cancel.child_token());

        tracing::info!(
            entries = doc.entries.len(),
            virtual_servers = doc.virtual_servers.len(),
            "gateway ready"
        );

        Ok(Self {
            catalog,
            supervisor,
            aggregator,
            router,
            admin_token,
            cancel,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Bearer token guarding the admin API, when one is configured.
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub async fn add_entry(&self, entry: RegistryEntry) -> crate::Result<()> {
        let id = entry.id.clone();
        self.catalog.add(entry).await?;
        // Listings built while a ref dangled must pick the entry up.
        self.aggregator.invalidate_entry(&id).await;
        Ok(())
    }

    /// Patch an entry. A changed connection retires whatever was derived
    /// from the old one.
    pub async fn update_entry(&self, id: &str, patch: EntryPatch) -> crate::Result<RegistryEntry> {
        let previous = self.catalog.get(id).await?;
        let updated = self.catalog.update(id, patch).await?;
        if !same_definition(&previous, &updated) {
            self.retire(&previous).await;
        }
        Ok(updated)
    }

    pub async fn remove_entry(&self, id: &str) -> crate::Result<()> {
        let previous = self.catalog.get(id).await?;
        self.catalog.remove(id).await?;
        self.retire(&previous).await;
        Ok(())
    }

    /// Stop the entry's process, forget its checkout and drop listings that
    /// include it.
    async fn retire(&self, previous: &RegistryEntry) {
        if previous.is_supervised() {
            if self.supervisor.release(&previous.id).await {
                tracing::info!(entry = %previous.id, "provider released after definition change");
            }
            self.supervisor.repo_fetcher().invalidate(&previous.id).await;
        }
        self.aggregator.invalidate_entry(&previous.id).await;
    }

    /// Drop merged listings after the catalog changed underneath, and retire
    /// entries whose definition changed or disappeared.
    pub async fn catalog_reloaded(&self, before: &CatalogDocument, after: &CatalogDocument) {
        for previous in &before.entries {
            let unchanged = after
                .entry(&previous.id)
                .is_some_and(|current| same_definition(previous, current));
            if !unchanged {
                self.retire(previous).await;
            }
        }
        self.aggregator.invalidate_all().await;
        tracing::info!("catalog reloaded, capability listings invalidated");
    }

    pub async fn health(&self) -> crate::Result<GatewayHealth> {
        let doc = self.catalog.snapshot().await?;
        let entries = doc
            .entries
            .iter()
            .map(|entry| {
                let (tools, prompts) = entry
                    .cached_capabilities
                    .as_ref()
                    .map(|c| (c.capabilities.tools.len(), c.capabilities.prompts.len()))
                    .unwrap_or((0, 0));
                EntryStatus {
                    id: entry.id.clone(),
                    kind: entry.kind,
                    health: entry.health.clone(),
                    tools,
                    prompts,
                }
            })
            .collect();

        Ok(GatewayHealth {
            status: if self.cancel.is_cancelled() {
                "stopping"
            } else {
                "ok"
            },
            version: env!("CARGO_PKG_VERSION"),
            virtual_servers: doc.virtual_servers.len(),
            entries,
            processes: self.supervisor.processes().await,
            ports_available: self.supervisor.ports_available(),
            ports_total: self.supervisor.ports_total(),
        })
    }

    /// Stop the reaper and every supervised process.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(reaper) = self.reaper.lock().await.take() {
            let _ = reaper.await;
        }
        self.supervisor.shutdown().await;
        tracing::info!("gateway stopped");
    }
}

/// Same connection and kind; health and recorded capabilities are ignored.
fn same_definition(a: &RegistryEntry, b: &RegistryEntry) -> bool {
    a.kind == b.kind && a.remote == b.remote && a.local == b.local && a.repo == b.repo
}

/// Re-read the catalog file. Returns whether the content differed from the
/// current snapshot; the gateway's own writes come back unchanged.
pub async fn reload_catalog(store: &FileStore, gateway: &Gateway) -> crate::Result<bool> {
    let before = store.load().await?;
    let after = store.reload().await?;
    let changed = *before != *after;
    if changed {
        gateway.catalog_reloaded(&before, &after).await;
    }
    Ok(changed)
}

/// Watch the catalog file and reload it on external edits.
///
/// The parent directory is watched because writes replace the file by rename.
pub async fn run_catalog_reload(
    store: Arc<FileStore>,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) {
    let path = store.path().to_path_buf();
    let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
        tracing::error!(path = %path.display(), "catalog path has no file name, hot reload disabled");
        return;
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create catalog watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        tracing::error!(path = %dir.display(), error = %e, "failed to watch catalog directory");
        return;
    }
    let _watcher = watcher;
    tracing::info!(path = %path.display(), "catalog hot reload watching");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        let touches_catalog = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()));
                        if !touches_catalog {
                            continue;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        while rx.try_recv().is_ok() {}

                        match reload_catalog(&store, &gateway).await {
                            Ok(true) => tracing::info!(path = %path.display(), "catalog reloaded"),
                            Ok(false) => tracing::debug!("catalog unchanged"),
                            Err(e) => tracing::warn!(
                                error = %e,
                                path = %path.display(),
                                "catalog reload failed, keeping previous catalog"
                            ),
                        }
                    }
                    Some(Err(e)) => tracing::warn!(error = %e, "catalog watcher error"),
                    None => return,
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("catalog hot reload cancelled");
                return;
            }
        }
    }
}
