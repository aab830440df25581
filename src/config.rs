//! Relay gateway configuration: deserialization and validation.

use crate::error::RelayError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Each value must be `${VAR}`. Unknown variables resolve to the
/// empty string (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // caught by validation, but handle gracefully
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level relay configuration, parsed from `relay.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Per-entry upstream credential overrides: entry id -> `${VAR}`.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Inbound endpoint, deadlines and listing cache.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Catalog file (JSON). Relative paths resolve against the process cwd.
    #[serde(default = "default_catalog_path")]
    pub catalog: PathBuf,
    /// Aggregate deadline applied to every inbound call.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    /// Per-provider budget during listing fan-out. Must be below the aggregate deadline.
    #[serde(default = "default_per_entry_timeout_ms")]
    pub per_entry_timeout_ms: u64,
    /// TTL of the merged capability listing per virtual server.
    #[serde(default = "default_list_cache_ttl_secs")]
    pub list_cache_ttl_secs: u64,
    /// `${VAR}` holding the bearer token for `/admin`. No token, no admin API.
    #[serde(default)]
    pub admin_token: Option<String>,
}

/// Process supervision and port pool.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Address local providers bind to and are probed on.
    #[serde(default = "default_supervisor_host")]
    pub host: String,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Where repo-backed entries are checked out.
    #[serde(default = "default_repo_cache_dir")]
    pub repo_cache_dir: PathBuf,
    /// Upper bound on one `git clone`/`fetch`/`checkout`; the git process is
    /// killed when it runs out.
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,
    /// Git executable used for repo checkouts.
    #[serde(default = "default_git_command")]
    pub git_command: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.json")
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_per_entry_timeout_ms() -> u64 {
    5_000
}

fn default_list_cache_ttl_secs() -> u64 {
    10
}

fn default_supervisor_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_range_start() -> u16 {
    41000
}

fn default_port_range_end() -> u16 {
    41099
}

fn default_readiness_timeout_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    100
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_repo_cache_dir() -> PathBuf {
    PathBuf::from(".relay/repos")
}

fn default_checkout_timeout_secs() -> u64 {
    120
}

fn default_git_command() -> String {
    "git".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            catalog: default_catalog_path(),
            default_deadline_ms: default_deadline_ms(),
            per_entry_timeout_ms: default_per_entry_timeout_ms(),
            list_cache_ttl_secs: default_list_cache_ttl_secs(),
            admin_token: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: default_supervisor_host(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            repo_cache_dir: default_repo_cache_dir(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            git_command: default_git_command(),
        }
    }
}

impl GatewayConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn per_entry_timeout(&self) -> Duration {
        Duration::from_millis(self.per_entry_timeout_ms)
    }

    pub fn list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.list_cache_ttl_secs)
    }
}

impl SupervisorConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }
}

impl RelayConfig {
    /// Validate the config, failing fast before anything is started.
    pub fn validate(&self) -> crate::Result<()> {
        let gw = &self.gateway;
        if gw.default_deadline_ms == 0 {
            return Err(RelayError::Validation(
                "gateway".to_string(),
                "default_deadline_ms must be > 0".to_string(),
            ));
        }
        if gw.per_entry_timeout_ms == 0 || gw.per_entry_timeout_ms >= gw.default_deadline_ms {
            return Err(RelayError::Validation(
                "gateway".to_string(),
                format!(
                    "per_entry_timeout_ms ({}) must be > 0 and below default_deadline_ms ({})",
                    gw.per_entry_timeout_ms, gw.default_deadline_ms
                ),
            ));
        }

        if let Some(token) = &gw.admin_token {
            if parse_env_ref(token).is_none() {
                return Err(RelayError::Validation(
                    "gateway".to_string(),
                    "admin_token must be a ${VAR} reference, got a literal value".to_string(),
                ));
            }
        }

        let sup = &self.supervisor;
        if sup.port_range_start == 0 || sup.port_range_start > sup.port_range_end {
            return Err(RelayError::Validation(
                "supervisor".to_string(),
                format!(
                    "invalid port range {}..={}",
                    sup.port_range_start, sup.port_range_end
                ),
            ));
        }
        if sup.probe_interval_ms == 0 {
            return Err(RelayError::Validation(
                "supervisor".to_string(),
                "probe_interval_ms must be > 0".to_string(),
            ));
        }
        if sup.checkout_timeout_secs == 0 {
            return Err(RelayError::Validation(
                "supervisor".to_string(),
                "checkout_timeout_secs must be > 0".to_string(),
            ));
        }
        if sup.readiness_timeout_ms < sup.probe_interval_ms {
            return Err(RelayError::Validation(
                "supervisor".to_string(),
                "readiness_timeout_ms must be >= probe_interval_ms".to_string(),
            ));
        }

        // Secrets must be ${VAR} references, never literal values
        for (entry, value) in &self.secrets {
            if parse_env_ref(value).is_none() {
                return Err(RelayError::Validation(
                    entry.clone(),
                    format!(
                        "secret for '{}' must be a ${{VAR}} reference, got a literal value",
                        entry
                    ),
                ));
            }
        }

        Ok(())
    }
}
