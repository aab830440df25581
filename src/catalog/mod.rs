//! Registry catalog: validated storage and lookup of provider definitions and
//! virtual servers. No process or provider side effects.

pub mod model;
pub mod store;

use std::sync::Arc;

use chrono::Utc;

use crate::error::RelayError;
pub use model::{
    ApiKeyRecord, CachedCapabilities, CapabilityRef, Connection, EntryHealth, EntryKind,
    EntryPatch, HealthStatus, InlinePrompt, InlinePromptArgument, LocalConnection,
    PromptArgument, PromptDescriptor, ProviderCapabilities, ProviderTransport, RegistryEntry,
    RemoteConnection, RepoConnection, ToolDescriptor, VirtualServer,
};
pub use store::{CatalogDocument, CatalogStore, FileStore, MemoryStore};

/// Typed operations over a [`CatalogStore`].
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn CatalogStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Catalog backed by a [`MemoryStore`] seeded with `doc`.
    pub fn in_memory(doc: CatalogDocument) -> Self {
        Self::new(Arc::new(MemoryStore::new(doc)))
    }

    pub async fn snapshot(&self) -> crate::Result<Arc<CatalogDocument>> {
        self.store.load().await
    }

    pub async fn add(&self, entry: RegistryEntry) -> crate::Result<()> {
        entry.validate()?;
        self.store
            .modify(Box::new(move |doc| {
                if doc.entry(&entry.id).is_some() {
                    return Err(RelayError::Conflict(entry.id.clone()));
                }
                tracing::info!(entry = %entry.id, kind = ?entry.kind, "registry entry added");
                doc.entries.push(entry);
                Ok(())
            }))
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> crate::Result<RegistryEntry> {
        self.snapshot()
            .await?
            .entry(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> crate::Result<Vec<RegistryEntry>> {
        Ok(self.snapshot().await?.entries.clone())
    }

    /// Apply `patch` and re-validate. The stored entry is untouched on failure.
    pub async fn update(&self, id: &str, patch: EntryPatch) -> crate::Result<RegistryEntry> {
        let target = id.to_string();
        let doc = self
            .store
            .modify(Box::new(move |doc| {
                let entry = doc
                    .entry_mut(&target)
                    .ok_or_else(|| RelayError::NotFound(target.clone()))?;
                let mut patched = entry.clone();
                patch.apply(&mut patched);
                patched.validate()?;
                *entry = patched;
                Ok(())
            }))
            .await?;
        doc.entry(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    /// Remove an entry. Fails with `InUse` while any virtual server references it.
    pub async fn remove(&self, id: &str) -> crate::Result<()> {
        let id = id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let users: Vec<&str> = doc
                    .virtual_servers
                    .iter()
                    .filter(|vs| vs.references(&id))
                    .map(|vs| vs.id.as_str())
                    .collect();
                if !users.is_empty() {
                    return Err(RelayError::InUse(id.clone(), users.join(", ")));
                }
                let before = doc.entries.len();
                doc.entries.retain(|e| e.id != id);
                if doc.entries.len() == before {
                    return Err(RelayError::NotFound(id.clone()));
                }
                tracing::info!(entry = %id, "registry entry removed");
                Ok(())
            }))
            .await?;
        Ok(())
    }

    /// Insert or replace a virtual server. Dangling refs are accepted.
    pub async fn put_virtual_server(&self, vs: VirtualServer) -> crate::Result<()> {
        vs.validate()?;
        self.store
            .modify(Box::new(move |doc| {
                match doc.virtual_server_mut(&vs.id) {
                    Some(existing) => *existing = vs,
                    None => doc.virtual_servers.push(vs),
                }
                Ok(())
            }))
            .await?;
        Ok(())
    }

    pub async fn get_virtual_server(&self, id: &str) -> crate::Result<VirtualServer> {
        self.snapshot()
            .await?
            .virtual_server(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    pub async fn list_virtual_servers(&self) -> crate::Result<Vec<VirtualServer>> {
        Ok(self.snapshot().await?.virtual_servers.clone())
    }

    /// Insert a virtual server that must not exist yet.
    pub async fn create_virtual_server(&self, vs: VirtualServer) -> crate::Result<()> {
        vs.validate()?;
        self.store
            .modify(Box::new(move |doc| {
                if doc.virtual_server(&vs.id).is_some() {
                    return Err(RelayError::Conflict(vs.id.clone()));
                }
                tracing::info!(server = %vs.id, "virtual server created");
                doc.virtual_servers.push(vs);
                Ok(())
            }))
            .await?;
        Ok(())
    }

    pub async fn remove_virtual_server(&self, id: &str) -> crate::Result<()> {
        let id = id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let before = doc.virtual_servers.len();
                doc.virtual_servers.retain(|vs| vs.id != id);
                if doc.virtual_servers.len() == before {
                    return Err(RelayError::NotFound(id.clone()));
                }
                Ok(())
            }))
            .await?;
        Ok(())
    }

    /// Attach a new key to a virtual server. Only its digest is stored.
    pub async fn add_api_key(
        &self,
        vs_id: &str,
        raw_key: &str,
        label: Option<String>,
    ) -> crate::Result<ApiKeyRecord> {
        if raw_key.is_empty() {
            return Err(RelayError::Validation(
                vs_id.to_string(),
                "api key must not be empty".to_string(),
            ));
        }
        let record = ApiKeyRecord::new(raw_key, vs_id, label);
        let stored = record.clone();
        let vs_id = vs_id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let vs = doc
                    .virtual_server_mut(&vs_id)
                    .ok_or_else(|| RelayError::NotFound(vs_id.clone()))?;
                if vs.api_keys.iter().any(|k| k.hash == stored.hash) {
                    return Err(RelayError::Conflict(format!("api key on '{}'", vs_id)));
                }
                vs.api_keys.push(stored);
                Ok(())
            }))
            .await?;
        Ok(record)
    }

    /// Revoke every live key of a virtual server and attach `raw_key` in one
    /// write, so there is no moment with two valid generations or none.
    pub async fn rotate_api_key(
        &self,
        vs_id: &str,
        raw_key: &str,
        label: Option<String>,
    ) -> crate::Result<ApiKeyRecord> {
        if raw_key.is_empty() {
            return Err(RelayError::Validation(
                vs_id.to_string(),
                "api key must not be empty".to_string(),
            ));
        }
        let record = ApiKeyRecord::new(raw_key, vs_id, label);
        let stored = record.clone();
        let vs_id = vs_id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let vs = doc
                    .virtual_server_mut(&vs_id)
                    .ok_or_else(|| RelayError::NotFound(vs_id.clone()))?;
                let mut revoked = 0;
                for key in vs.api_keys.iter_mut().filter(|k| !k.revoked) {
                    key.revoked = true;
                    revoked += 1;
                }
                vs.api_keys.push(stored);
                tracing::info!(server = %vs_id, revoked, "api key rotated");
                Ok(())
            }))
            .await?;
        Ok(record)
    }

    /// Revoke a key given either the raw key or its hex digest.
    pub async fn revoke_api_key(&self, vs_id: &str, key_or_hash: &str) -> crate::Result<()> {
        let digest = model::hash_key(key_or_hash);
        let key_or_hash = key_or_hash.to_string();
        let vs_id = vs_id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let vs = doc
                    .virtual_server_mut(&vs_id)
                    .ok_or_else(|| RelayError::NotFound(vs_id.clone()))?;
                let record = vs
                    .api_keys
                    .iter_mut()
                    .find(|k| k.hash == digest || k.hash == key_or_hash)
                    .ok_or_else(|| RelayError::NotFound(format!("api key on '{}'", vs_id)))?;
                record.revoked = true;
                tracing::info!(server = %vs_id, label = ?record.label, "api key revoked");
                Ok(())
            }))
            .await?;
        Ok(())
    }

    /// Store the capabilities observed on a successful fetch.
    pub async fn record_capabilities(
        &self,
        entry_id: &str,
        capabilities: ProviderCapabilities,
    ) -> crate::Result<()> {
        let entry_id = entry_id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let entry = doc
                    .entry_mut(&entry_id)
                    .ok_or_else(|| RelayError::NotFound(entry_id.clone()))?;
                entry.cached_capabilities = Some(CachedCapabilities {
                    capabilities,
                    refreshed_at: Utc::now(),
                });
                entry.health = EntryHealth::healthy();
                Ok(())
            }))
            .await?;
        Ok(())
    }

    pub async fn record_health(&self, entry_id: &str, health: EntryHealth) -> crate::Result<()> {
        let entry_id = entry_id.to_string();
        self.store
            .modify(Box::new(move |doc| {
                let entry = doc
                    .entry_mut(&entry_id)
                    .ok_or_else(|| RelayError::NotFound(entry_id.clone()))?;
                entry.health = health;
                Ok(())
            }))
            .await?;
        Ok(())
    }
}
