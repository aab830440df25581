//! Immutable plugin snapshots and the directory watcher that replaces them.
//!
//! A snapshot is built from scratch on every change and swapped in whole.
//! Callers clone the inner `Arc` once per invocation, so a reload never
//! changes the set an in-flight call is running against.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use rmcp::service::{Peer, RoleServer};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::catalog::ToolDescriptor;
use crate::error::RelayError;
use crate::plugin::manifest::{MANIFEST_FILE, PluginTool};

pub type SharedPluginSet = Arc<RwLock<Arc<PluginSet>>>;
pub type SharedPeers = Arc<Mutex<Vec<Peer<RoleServer>>>>;

#[derive(Debug, Default)]
pub struct PluginSet {
    tools: BTreeMap<String, Arc<PluginTool>>,
    /// Directories whose manifest was rejected, with the reason.
    skipped: Vec<(PathBuf, String)>,
    loaded_at: Option<DateTime<Utc>>,
}

impl PluginSet {
    /// Scan each immediate subdirectory of `root` for a manifest.
    ///
    /// Broken manifests are skipped with a warning. When two directories
    /// declare the same tool name, the one that sorts first wins.
    pub async fn discover(root: &Path) -> crate::Result<Self> {
        let mut reader = tokio::fs::read_dir(root).await.map_err(|e| {
            RelayError::Validation(root.display().to_string(), format!("cannot read: {}", e))
        })?;
        let mut dirs = Vec::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| RelayError::Storage(e.to_string()))?
        {
            let path = item.path();
            if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut set = PluginSet {
            loaded_at: Some(Utc::now()),
            ..PluginSet::default()
        };
        for dir in dirs {
            match PluginTool::load(&dir).await {
                Ok(tool) => {
                    if set.tools.contains_key(tool.name()) {
                        let reason = format!("duplicate tool name '{}'", tool.name());
                        tracing::warn!(dir = %dir.display(), "{}", reason);
                        set.skipped.push((dir, reason));
                    } else {
                        set.tools.insert(tool.name().to_string(), Arc::new(tool));
                    }
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping plugin");
                    set.skipped.push((dir, e.to_string()));
                }
            }
        }
        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginTool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.manifest.descriptor()).collect()
    }

    pub fn skipped(&self) -> &[(PathBuf, String)] {
        &self.skipped
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Rebuild the snapshot and swap it in. The previous one stays on failure.
pub async fn reload(root: &Path, plugins: &SharedPluginSet) -> crate::Result<usize> {
    let fresh = PluginSet::discover(root).await?;
    let count = fresh.len();
    *plugins.write().await = Arc::new(fresh);
    Ok(count)
}

/// Watch `root` recursively and reload on change, notifying connected peers.
pub async fn run_hot_reload(
    root: PathBuf,
    plugins: SharedPluginSet,
    peers: SharedPeers,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create plugin directory watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        tracing::error!(path = %root.display(), error = %e, "failed to watch plugin directory");
        return;
    }
    // Dropping the watcher stops the OS-level watch.
    let _watcher = watcher;

    tracing::info!(path = %root.display(), "watching plugin directory");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        while rx.try_recv().is_ok() {}

                        match reload(&root, &plugins).await {
                            Ok(count) => {
                                tracing::info!(tools = count, path = %root.display(), "plugins reloaded");
                                notify_peers(&peers).await;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "plugin reload failed, keeping previous set");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "plugin watcher error");
                    }
                    None => return,
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("plugin hot reload cancelled");
                return;
            }
        }
    }
}

/// Send tools-list-changed to every peer, dropping the ones that fail.
pub async fn notify_peers(peers: &SharedPeers) {
    let mut peers = peers.lock().await;
    let mut live = Vec::with_capacity(peers.len());
    for peer in peers.drain(..) {
        match peer.notify_tool_list_changed().await {
            Ok(_) => live.push(peer),
            Err(e) => tracing::debug!(error = %e, "pruning stale peer"),
        }
    }
    *peers = live;
}
