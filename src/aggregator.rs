//! Capability aggregation across the providers a virtual server references.
//!
//! One fetch per distinct entry, run concurrently. Each fetch gets a single
//! per-entry budget that its one retry must also fit in. A failed entry falls
//! back to its last recorded capabilities. The listing only fails when no
//! referenced entry yields anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::catalog::{
    CapabilityRef, Catalog, CatalogDocument, EntryHealth, InlinePrompt, PromptDescriptor,
    ProviderCapabilities, RegistryEntry, ToolDescriptor, VirtualServer,
};
use crate::connector::ProviderConnector;
use crate::error::RelayError;
use crate::namespace::{namespace_prompt, namespace_tool};

/// Merged view of one virtual server's capabilities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Listing {
    /// Namespaced tools in `tool_refs` order.
    pub tools: Vec<ToolDescriptor>,
    /// Namespaced provider prompts, then the server's inline prompts.
    pub prompts: Vec<PromptDescriptor>,
    /// Referenced entries that contributed nothing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<String>,
}

struct CachedListing {
    listing: Arc<Listing>,
    built_at: Instant,
    tool_refs: Vec<CapabilityRef>,
    prompt_refs: Vec<CapabilityRef>,
    custom_prompts: Vec<InlinePrompt>,
}

impl CachedListing {
    fn serves(&self, vs: &VirtualServer, ttl: Duration) -> bool {
        self.built_at.elapsed() < ttl
            && self.tool_refs == vs.tool_refs
            && self.prompt_refs == vs.prompt_refs
            && self.custom_prompts == vs.custom_prompts
    }

    fn references(&self, entry_id: &str) -> bool {
        self.tool_refs
            .iter()
            .chain(self.prompt_refs.iter())
            .any(|r| r.entry == entry_id)
    }
}

struct Inner {
    catalog: Catalog,
    connector: ProviderConnector,
    per_entry_timeout: Duration,
    ttl: Duration,
    listings: RwLock<HashMap<String, Arc<CachedListing>>>,
    refreshed: Mutex<HashMap<String, Instant>>,
}

/// Builds and caches [`Listing`]s per virtual server.
///
/// Listings are cached for the configured TTL and keyed by server id; a
/// cached listing is only served while the server's refs still match it.
/// Clones share one cache.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    /// `per_entry_timeout` bounds each provider fetch, retry included; `ttl`
    /// bounds how long a merged listing is reused.
    pub fn new(
        catalog: Catalog,
        connector: ProviderConnector,
        per_entry_timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                connector,
                per_entry_timeout,
                ttl,
                listings: RwLock::new(HashMap::new()),
                refreshed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Namespaced tools of every referenced entry, in `tool_refs` order.
    pub async fn list_tools(&self, vs: &VirtualServer) -> crate::Result<Vec<ToolDescriptor>> {
        Ok(self.listing(vs).await?.tools.clone())
    }

    /// Namespaced prompts of every referenced entry, followed by the inline ones.
    pub async fn list_prompts(&self, vs: &VirtualServer) -> crate::Result<Vec<PromptDescriptor>> {
        Ok(self.listing(vs).await?.prompts.clone())
    }

    /// Cached merged listing, rebuilt when stale or when the server's refs changed.
    pub async fn listing(&self, vs: &VirtualServer) -> crate::Result<Arc<Listing>> {
        self.listing_within(vs, self.inner.per_entry_timeout).await
    }

    /// Like [`Aggregator::listing`], but no fetch outlives `deadline`.
    ///
    /// A caller deadline shorter than the per-entry budget may leave entries
    /// out; such a listing is returned but not cached, so a hurried caller
    /// never degrades the view other callers get.
    pub async fn listing_within(
        &self,
        vs: &VirtualServer,
        deadline: Duration,
    ) -> crate::Result<Arc<Listing>> {
        let hit = self
            .inner
            .listings
            .read()
            .await
            .get(&vs.id)
            .filter(|cached| cached.serves(vs, self.inner.ttl))
            .map(|cached| cached.listing.clone());
        if let Some(listing) = hit {
            return Ok(listing);
        }

        let budget = deadline.min(self.inner.per_entry_timeout);
        let listing = Arc::new(self.build(vs, budget).await?);
        if budget < self.inner.per_entry_timeout && !listing.unavailable.is_empty() {
            return Ok(listing);
        }
        let cached = Arc::new(CachedListing {
            listing: listing.clone(),
            built_at: Instant::now(),
            tool_refs: vs.tool_refs.clone(),
            prompt_refs: vs.prompt_refs.clone(),
            custom_prompts: vs.custom_prompts.clone(),
        });
        self.inner
            .listings
            .write()
            .await
            .insert(vs.id.clone(), cached);
        Ok(listing)
    }

    async fn build(&self, vs: &VirtualServer, budget: Duration) -> crate::Result<Listing> {
        let doc = self.inner.catalog.snapshot().await?;
        let entry_ids = vs.referenced_entries();

        let fetched: Vec<Option<ProviderCapabilities>> =
            join_all(entry_ids.iter().map(|id| self.fetch_entry(&doc, id, budget))).await;

        let mut by_entry: HashMap<&str, ProviderCapabilities> = HashMap::new();
        let mut unavailable = Vec::new();
        for (id, caps) in entry_ids.iter().zip(fetched) {
            match caps {
                Some(caps) => {
                    by_entry.insert(id, caps);
                }
                None => unavailable.push(id.to_string()),
            }
        }

        if !entry_ids.is_empty() && by_entry.is_empty() {
            return Err(RelayError::Unreachable(
                vs.id.clone(),
                format!("no referenced provider answered ({})", unavailable.join(", ")),
            ));
        }

        let tools = vs
            .tool_refs
            .iter()
            .filter_map(|r| {
                let caps = by_entry.get(r.entry.as_str())?;
                let tool = caps.tools.iter().find(|t| t.name == r.name)?;
                Some(namespace_tool(&r.entry, tool.clone()))
            })
            .collect();

        let mut prompts: Vec<PromptDescriptor> = vs
            .prompt_refs
            .iter()
            .filter_map(|r| {
                let caps = by_entry.get(r.entry.as_str())?;
                let prompt = caps.prompts.iter().find(|p| p.name == r.name)?;
                Some(namespace_prompt(&r.entry, prompt.clone()))
            })
            .collect();
        prompts.extend(vs.custom_prompts.iter().map(InlinePrompt::descriptor));

        if !unavailable.is_empty() {
            tracing::warn!(
                server = %vs.id,
                unavailable = %unavailable.join(", "),
                "listing is partial"
            );
        }

        Ok(Listing {
            tools,
            prompts,
            unavailable,
        })
    }

    /// Live capabilities of one entry, or its recorded ones if the fetch fails.
    /// Both attempts share `budget`; the retry only gets what the first left.
    async fn fetch_entry(
        &self,
        doc: &CatalogDocument,
        entry_id: &str,
        budget: Duration,
    ) -> Option<ProviderCapabilities> {
        let Some(entry) = doc.entry(entry_id) else {
            tracing::warn!(entry = %entry_id, "referenced entry does not exist");
            return None;
        };

        let started = Instant::now();
        let mut last_error = None;
        for attempt in 1..=2 {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match self
                .inner
                .connector
                .list_capabilities(entry, remaining)
                .await
            {
                Ok(caps) => {
                    if let Err(e) = self
                        .inner
                        .catalog
                        .record_capabilities(entry_id, caps.clone())
                        .await
                    {
                        tracing::debug!(entry = %entry_id, error = %e, "could not record capabilities");
                    }
                    return Some(caps);
                }
                Err(e) => {
                    tracing::debug!(entry = %entry_id, attempt, error = %e, "capability fetch failed");
                    last_error = Some(e);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        if let Err(e) = self
            .inner
            .catalog
            .record_health(entry_id, EntryHealth::unreachable(message.clone()))
            .await
        {
            tracing::debug!(entry = %entry_id, error = %e, "could not record health");
        }

        match &entry.cached_capabilities {
            Some(cached) => {
                tracing::warn!(
                    entry = %entry_id,
                    error = %message,
                    refreshed_at = %cached.refreshed_at,
                    "provider unavailable, serving recorded capabilities"
                );
                Some(cached.capabilities.clone())
            }
            None => {
                tracing::warn!(entry = %entry_id, error = %message, "provider unavailable, omitted");
                None
            }
        }
    }

    /// Drop every cached listing that references `entry_id`.
    pub async fn invalidate_entry(&self, entry_id: &str) {
        self.inner
            .listings
            .write()
            .await
            .retain(|_, cached| !cached.references(entry_id));
    }

    /// Drop every cached listing.
    pub async fn invalidate_all(&self) {
        self.inner.listings.write().await.clear();
    }

    /// After a successful invoke, refresh the entry's recorded capabilities in
    /// the background. At most one refresh per entry per cache TTL.
    pub async fn note_invoke_success(&self, entry: &RegistryEntry) {
        {
            let mut refreshed = self.inner.refreshed.lock().await;
            let recent = refreshed
                .get(&entry.id)
                .is_some_and(|at| at.elapsed() < self.inner.ttl);
            if recent {
                return;
            }
            refreshed.insert(entry.id.clone(), Instant::now());
        }

        let this = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            match this
                .inner
                .connector
                .list_capabilities(&entry, this.inner.per_entry_timeout)
                .await
            {
                Ok(caps) => {
                    if let Err(e) = this.inner.catalog.record_capabilities(&entry.id, caps).await {
                        tracing::debug!(entry = %entry.id, error = %e, "could not record capabilities");
                    }
                    this.invalidate_entry(&entry.id).await;
                    tracing::debug!(entry = %entry.id, "capabilities refreshed after invoke");
                }
                Err(e) => {
                    tracing::debug!(entry = %entry.id, error = %e, "background refresh failed");
                }
            }
        });
    }
}
