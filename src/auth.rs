//! Inbound API-key checks and outbound credential lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{Catalog, VirtualServer};
use crate::config::parse_env_ref;
use crate::error::RelayError;

/// Source of upstream credentials, keyed by registry entry id.
pub trait SecretStore: Send + Sync {
    fn secret_for(&self, entry_id: &str) -> Option<String>;
}

/// Reads `RELAY_SECRET_<ENTRY_ID>` (uppercased, `-` as `_`), or the env var an
/// override names (`[secrets] my-entry = "${MY_TOKEN}"`).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    overrides: HashMap<String, String>,
}

impl EnvSecretStore {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// Env var consulted for `entry_id` when no override exists.
    pub fn default_var(entry_id: &str) -> String {
        format!(
            "RELAY_SECRET_{}",
            entry_id.to_uppercase().replace('-', "_")
        )
    }

    fn var_for(&self, entry_id: &str) -> String {
        self.overrides
            .get(entry_id)
            .and_then(|v| parse_env_ref(v))
            .map(str::to_string)
            .unwrap_or_else(|| Self::default_var(entry_id))
    }
}

impl SecretStore for EnvSecretStore {
    fn secret_for(&self, entry_id: &str) -> Option<String> {
        std::env::var(self.var_for(entry_id))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

/// Fixed map of secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore(pub HashMap<String, String>);

impl SecretStore for StaticSecretStore {
    fn secret_for(&self, entry_id: &str) -> Option<String> {
        self.0.get(entry_id).cloned()
    }
}

/// Validates presented keys against the catalog on every call, so a
/// revocation is visible to the very next check.
#[derive(Clone)]
pub struct AuthGuard {
    catalog: Catalog,
    secrets: Arc<dyn SecretStore>,
}

impl AuthGuard {
    pub fn new(catalog: Catalog, secrets: Arc<dyn SecretStore>) -> Self {
        Self { catalog, secrets }
    }

    /// Return the virtual server if `presented_key` is a live key for it.
    pub async fn authenticate(
        &self,
        vs_id: &str,
        presented_key: Option<&str>,
    ) -> crate::Result<VirtualServer> {
        let deny = |reason: &str| RelayError::Auth(vs_id.to_string(), reason.to_string());

        let doc = self.catalog.snapshot().await?;
        let vs = doc
            .virtual_server(vs_id)
            .ok_or_else(|| deny("unknown virtual server"))?;
        if !vs.enabled {
            return Err(deny("disabled"));
        }
        let key = presented_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| deny("missing api key"))?;

        // Check every record so timing does not reveal which one matched.
        let accepted = vs.api_keys.iter().fold(false, |acc, record| {
            let hit = record.matches(key) && !record.revoked && record.scope == vs.id;
            acc | hit
        });
        if !accepted {
            tracing::warn!(server = %vs_id, "rejected api key");
            return Err(deny("invalid or revoked api key"));
        }
        Ok(vs.clone())
    }

    pub fn outbound_credential_for(&self, entry_id: &str) -> Option<String> {
        self.secrets.secret_for(entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogDocument;

    async fn guard_with(vs: VirtualServer) -> (AuthGuard, Catalog) {
        let catalog = Catalog::in_memory(CatalogDocument::default());
        catalog.put_virtual_server(vs).await.unwrap();
        let guard = AuthGuard::new(catalog.clone(), Arc::new(StaticSecretStore::default()));
        (guard, catalog)
    }

    #[tokio::test]
    async fn test_valid_key_accepted_repeatedly() {
        let (guard, _) = guard_with(VirtualServer::new("vs1", "One").with_key("k1")).await;
        for _ in 0..3 {
            let vs = guard.authenticate("vs1", Some("k1")).await.unwrap();
            assert_eq!(vs.id, "vs1");
        }
    }

    #[tokio::test]
    async fn test_wrong_missing_and_unknown() {
        let (guard, _) = guard_with(VirtualServer::new("vs1", "One").with_key("k1")).await;
        assert!(matches!(
            guard.authenticate("vs1", Some("k2")).await,
            Err(RelayError::Auth(..))
        ));
        assert!(matches!(
            guard.authenticate("vs1", None).await,
            Err(RelayError::Auth(_, reason)) if reason == "missing api key"
        ));
        assert!(matches!(
            guard.authenticate("nope", Some("k1")).await,
            Err(RelayError::Auth(..))
        ));
    }

    #[tokio::test]
    async fn test_revocation_visible_on_next_check() {
        let (guard, catalog) = guard_with(VirtualServer::new("vs1", "One").with_key("k1")).await;
        guard.authenticate("vs1", Some("k1")).await.unwrap();
        catalog.revoke_api_key("vs1", "k1").await.unwrap();
        assert!(matches!(
            guard.authenticate("vs1", Some("k1")).await,
            Err(RelayError::Auth(..))
        ));
    }

    #[tokio::test]
    async fn test_disabled_server_rejected() {
        let mut vs = VirtualServer::new("vs1", "One").with_key("k1");
        vs.enabled = false;
        let (guard, _) = guard_with(vs).await;
        assert!(matches!(
            guard.authenticate("vs1", Some("k1")).await,
            Err(RelayError::Auth(_, reason)) if reason == "disabled"
        ));
    }

    #[tokio::test]
    async fn test_key_of_other_server_rejected() {
        let catalog = Catalog::in_memory(CatalogDocument::default());
        catalog
            .put_virtual_server(VirtualServer::new("vs1", "One").with_key("k1"))
            .await
            .unwrap();
        catalog
            .put_virtual_server(VirtualServer::new("vs2", "Two").with_key("k2"))
            .await
            .unwrap();
        let guard = AuthGuard::new(catalog, Arc::new(StaticSecretStore::default()));
        assert!(guard.authenticate("vs2", Some("k1")).await.is_err());
    }

    #[test]
    fn test_env_secret_default_var_name() {
        assert_eq!(
            EnvSecretStore::default_var("threat-intel"),
            "RELAY_SECRET_THREAT_INTEL"
        );
    }

    #[test]
    fn test_env_secret_store_override_and_default() {
        // SAFETY: test-only, these variable names are unique to this test.
        unsafe {
            std::env::set_var("RELAY_SECRET_AUTH_TEST_DEFAULT", "from-default");
            std::env::set_var("AUTH_TEST_OVERRIDE_TOKEN", "from-override");
        }
        let mut overrides = HashMap::new();
        overrides.insert(
            "auth-test-custom".to_string(),
            "${AUTH_TEST_OVERRIDE_TOKEN}".to_string(),
        );
        let store = EnvSecretStore::new(overrides);
        assert_eq!(
            store.secret_for("auth-test-default").as_deref(),
            Some("from-default")
        );
        assert_eq!(
            store.secret_for("auth-test-custom").as_deref(),
            Some("from-override")
        );
        assert_eq!(store.secret_for("auth-test-unset"), None);
        // SAFETY: test-only cleanup.
        unsafe {
            std::env::remove_var("RELAY_SECRET_AUTH_TEST_DEFAULT");
            std::env::remove_var("AUTH_TEST_OVERRIDE_TOKEN");
        }
    }
}
