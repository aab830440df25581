//! Catalog persistence behind an abstract read-modify-write interface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::catalog::model::{RegistryEntry, VirtualServer};
use crate::error::RelayError;

/// The whole catalog as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogDocument {
    #[serde(default)]
    pub entries: Vec<RegistryEntry>,
    #[serde(default)]
    pub virtual_servers: Vec<VirtualServer>,
}

impl CatalogDocument {
    pub fn entry(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: &str) -> Option<&mut RegistryEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn virtual_server(&self, id: &str) -> Option<&VirtualServer> {
        self.virtual_servers.iter().find(|v| v.id == id)
    }

    pub fn virtual_server_mut(&mut self, id: &str) -> Option<&mut VirtualServer> {
        self.virtual_servers.iter_mut().find(|v| v.id == id)
    }

    /// Validate every record and id uniqueness.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !seen.insert(entry.id.as_str()) {
                return Err(RelayError::Validation(
                    entry.id.clone(),
                    "duplicate entry id".to_string(),
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for vs in &self.virtual_servers {
            vs.validate()?;
            if !seen.insert(vs.id.as_str()) {
                return Err(RelayError::Validation(
                    vs.id.clone(),
                    "duplicate virtual server id".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Mutation applied atomically to the catalog document.
pub type Mutation = Box<dyn FnOnce(&mut CatalogDocument) -> crate::Result<()> + Send>;

/// Key-value style backend with atomic read-modify-write.
///
/// `load` returns an immutable snapshot; readers never observe a half-applied
/// mutation. `modify` either persists the whole mutated document or nothing.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load(&self) -> crate::Result<Arc<CatalogDocument>>;

    async fn modify(&self, mutation: Mutation) -> crate::Result<Arc<CatalogDocument>>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    doc: RwLock<Arc<CatalogDocument>>,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(doc: CatalogDocument) -> Self {
        Self {
            doc: RwLock::new(Arc::new(doc)),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load(&self) -> crate::Result<Arc<CatalogDocument>> {
        Ok(self.doc.read().await.clone())
    }

    async fn modify(&self, mutation: Mutation) -> crate::Result<Arc<CatalogDocument>> {
        let _guard = self.write_lock.lock().await;
        let mut next = (**self.doc.read().await).clone();
        mutation(&mut next)?;
        let next = Arc::new(next);
        *self.doc.write().await = next.clone();
        Ok(next)
    }
}

/// Flat JSON file. Writes go to a sibling temp file which is then renamed over
/// the original, so a crash never leaves a truncated catalog behind.
pub struct FileStore {
    path: PathBuf,
    doc: RwLock<Arc<CatalogDocument>>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open `path`. A missing file is an empty catalog.
    pub async fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let doc = read_document(&path).await?;
        Ok(Self {
            path,
            doc: RwLock::new(Arc::new(doc)),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing the in-memory snapshot.
    ///
    /// On parse or validation failure the previous snapshot stays in place.
    pub async fn reload(&self) -> crate::Result<Arc<CatalogDocument>> {
        let _guard = self.write_lock.lock().await;
        let doc = read_document(&self.path).await?;
        doc.validate()?;
        let doc = Arc::new(doc);
        *self.doc.write().await = doc.clone();
        Ok(doc)
    }

    async fn persist(&self, doc: &CatalogDocument) -> crate::Result<()> {
        let encoded = serde_json::to_vec_pretty(doc)
            .map_err(|e| RelayError::Storage(format!("encode catalog: {}", e)))?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog.json".to_string());
        let tmp = self.path.with_file_name(format!(".{}.tmp", file_name));
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RelayError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&tmp, encoded)
            .await
            .map_err(|e| RelayError::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RelayError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

async fn read_document(path: &Path) -> crate::Result<CatalogDocument> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(CatalogDocument::default()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::Storage(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CatalogDocument::default()),
        Err(e) => Err(RelayError::Storage(format!("{}: {}", path.display(), e))),
    }
}

#[async_trait]
impl CatalogStore for FileStore {
    async fn load(&self) -> crate::Result<Arc<CatalogDocument>> {
        Ok(self.doc.read().await.clone())
    }

    async fn modify(&self, mutation: Mutation) -> crate::Result<Arc<CatalogDocument>> {
        let _guard = self.write_lock.lock().await;
        let mut next = (**self.doc.read().await).clone();
        mutation(&mut next)?;
        self.persist(&next).await?;
        let next = Arc::new(next);
        *self.doc.write().await = next.clone();
        Ok(next)
    }
}
