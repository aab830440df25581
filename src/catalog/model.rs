//! Catalog records: registry entries, virtual servers and their API keys.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::parse_env_ref;
use crate::error::RelayError;
use crate::repo::RepoSource;

/// How a registry entry is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Remote,
    Local,
    Repo,
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTransport {
    /// Streamable-HTTP MCP (handshake, then `tools/list`, `tools/call`, ...)
    #[default]
    Mcp,
    /// Bare JSON-RPC 2.0 over HTTP POST, no session handshake
    Jsonrpc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConnection {
    pub url: String,
    #[serde(default)]
    pub transport: ProviderTransport,
}

/// Launch recipe for a locally spawned provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalConnection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Env var references (`${VAR}`), resolved at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Env var that receives the allocated port.
    #[serde(default = "default_port_env")]
    pub port_env: String,
    /// When set, `<port_arg> <port>` is appended to the arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_arg: Option<String>,
    #[serde(default)]
    pub transport: ProviderTransport,
    /// URL path the provider serves on.
    #[serde(default = "default_path")]
    pub path: String,
}

/// Source-repository reference, checked out and then launched like a local entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoConnection {
    pub source: String,
    #[serde(rename = "ref", default = "default_ref")]
    pub git_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<PathBuf>,
    /// Launch recipe, run from `<checkout>/<subpath>`.
    #[serde(flatten)]
    pub launch: LocalConnection,
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_path() -> String {
    "/mcp".to_string()
}

fn default_ref() -> String {
    "main".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Borrowed view of the populated connection section.
#[derive(Debug, Clone, Copy)]
pub enum Connection<'a> {
    Remote(&'a RemoteConnection),
    Local(&'a LocalConnection),
    Repo(&'a RepoConnection),
}

/// A tool as advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

pub(crate) fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A prompt as advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Everything a provider exposes, as returned by one listing round.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderCapabilities {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
}

/// Last observed capabilities of an entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedCapabilities {
    #[serde(flatten)]
    pub capabilities: ProviderCapabilities,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unreachable,
}

/// Outcome of the last contact with an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntryHealth {
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl EntryHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            checked_at: Some(Utc::now()),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unreachable,
            message: Some(message.into()),
            checked_at: Some(Utc::now()),
        }
    }
}

/// A configured downstream provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub id: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_capabilities: Option<CachedCapabilities>,
    #[serde(default)]
    pub health: EntryHealth,
}

impl RegistryEntry {
    pub fn remote(id: impl Into<String>, url: impl Into<String>, transport: ProviderTransport) -> Self {
        Self::bare(id, EntryKind::Remote).with_remote(RemoteConnection {
            url: url.into(),
            transport,
        })
    }

    pub fn local(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::bare(id, EntryKind::Local).with_local(LocalConnection {
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            port_env: default_port_env(),
            port_arg: None,
            transport: ProviderTransport::default(),
            path: default_path(),
        })
    }

    fn bare(id: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            id: id.into(),
            kind,
            remote: None,
            local: None,
            repo: None,
            cached_capabilities: None,
            health: EntryHealth::default(),
        }
    }

    fn with_remote(mut self, remote: RemoteConnection) -> Self {
        self.remote = Some(remote);
        self
    }

    fn with_local(mut self, local: LocalConnection) -> Self {
        self.local = Some(local);
        self
    }

    /// The connection section matching `kind`.
    pub fn connection(&self) -> crate::Result<Connection<'_>> {
        let missing = |section: &str| {
            RelayError::Validation(
                self.id.clone(),
                format!("{} entry requires a '{}' section", section, section),
            )
        };
        match self.kind {
            EntryKind::Remote => self
                .remote
                .as_ref()
                .map(Connection::Remote)
                .ok_or_else(|| missing("remote")),
            EntryKind::Local => self
                .local
                .as_ref()
                .map(Connection::Local)
                .ok_or_else(|| missing("local")),
            EntryKind::Repo => self
                .repo
                .as_ref()
                .map(Connection::Repo)
                .ok_or_else(|| missing("repo")),
        }
    }

    /// True when the entry needs a supervised process.
    pub fn is_supervised(&self) -> bool {
        matches!(self.kind, EntryKind::Local | EntryKind::Repo)
    }

    /// Validate the entry before it is stored.
    pub fn validate(&self) -> crate::Result<()> {
        let id = &self.id;
        validate_slug(id)?;

        let populated = [
            self.remote.is_some(),
            self.local.is_some(),
            self.repo.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if populated != 1 {
            return Err(RelayError::Validation(
                id.clone(),
                "exactly one of 'remote', 'local' or 'repo' must be populated".to_string(),
            ));
        }

        match self.connection()? {
            Connection::Remote(remote) => {
                if !(remote.url.starts_with("http://") || remote.url.starts_with("https://")) {
                    return Err(RelayError::Validation(
                        id.clone(),
                        format!("remote url must be http(s), got '{}'", remote.url),
                    ));
                }
            }
            Connection::Local(local) => validate_launch(id, local)?,
            Connection::Repo(repo) => {
                RepoSource::parse(&repo.source).map_err(|reason| {
                    RelayError::Validation(
                        id.clone(),
                        format!("cannot parse repo source '{}': {}", repo.source, reason),
                    )
                })?;
                if repo.git_ref.trim().is_empty() {
                    return Err(RelayError::Validation(
                        id.clone(),
                        "repo entry requires a non-empty 'ref'".to_string(),
                    ));
                }
                let escapes = repo.subpath.as_ref().is_some_and(|subpath| {
                    subpath.is_absolute()
                        || subpath
                            .components()
                            .any(|c| matches!(c, std::path::Component::ParentDir))
                });
                if escapes {
                    return Err(RelayError::Validation(
                        id.clone(),
                        "repo 'subpath' must be relative and stay inside the checkout".to_string(),
                    ));
                }
                validate_launch(id, &repo.launch)?;
            }
        }

        Ok(())
    }
}

fn validate_launch(id: &str, launch: &LocalConnection) -> crate::Result<()> {
    if launch.command.trim().is_empty() {
        return Err(RelayError::Validation(
            id.to_string(),
            "local entry requires non-empty 'command'".to_string(),
        ));
    }
    if launch.port_env.is_empty() {
        return Err(RelayError::Validation(
            id.to_string(),
            "'port_env' must not be empty".to_string(),
        ));
    }
    if !launch.path.starts_with('/') {
        return Err(RelayError::Validation(
            id.to_string(),
            format!("'path' must start with '/', got '{}'", launch.path),
        ));
    }
    for (key, value) in &launch.env {
        if parse_env_ref(value).is_none() {
            return Err(RelayError::Validation(
                id.to_string(),
                format!(
                    "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                    key, value
                ),
            ));
        }
    }
    Ok(())
}

/// Ids double as namespace prefixes: no `__` separator inside, and no `_` at
/// either end where it would merge with the separator (`a_` + `__` + `scan`).
pub(crate) fn validate_slug(id: &str) -> crate::Result<()> {
    if id.is_empty()
        || id.contains("__")
        || id.starts_with('_')
        || id.ends_with('_')
        || !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RelayError::Validation(
            id.to_string(),
            "id must be non-empty alphanumeric with hyphens or inner single underscores".to_string(),
        ));
    }
    Ok(())
}

/// Partial update for a registry entry. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryPatch {
    pub kind: Option<EntryKind>,
    pub remote: Option<RemoteConnection>,
    pub local: Option<LocalConnection>,
    pub repo: Option<RepoConnection>,
}

impl EntryPatch {
    /// Apply to `entry`. Switching kind clears the sections of the old kind.
    pub fn apply(self, entry: &mut RegistryEntry) {
        if let Some(kind) = self.kind.filter(|k| *k != entry.kind) {
            entry.kind = kind;
            entry.remote = None;
            entry.local = None;
            entry.repo = None;
            entry.cached_capabilities = None;
            entry.health = EntryHealth::default();
        }
        if self.remote.is_some() {
            entry.remote = self.remote;
        }
        if self.local.is_some() {
            entry.local = self.local;
        }
        if self.repo.is_some() {
            entry.repo = self.repo;
        }
    }
}

/// Reference from a virtual server to one capability of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CapabilityRef {
    pub entry: String,
    pub name: String,
}

impl CapabilityRef {
    pub fn new(entry: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InlinePromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Prompt owned by a virtual server; `{{name}}` placeholders are filled from arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InlinePrompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<InlinePromptArgument>,
    pub content: String,
}

impl InlinePrompt {
    pub fn descriptor(&self) -> PromptDescriptor {
        PromptDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            arguments: self
                .arguments
                .iter()
                .map(|a| PromptArgument {
                    name: a.name.clone(),
                    description: a.description.clone(),
                    required: a.required,
                })
                .collect(),
        }
    }

    /// Substitute `{{arg}}` placeholders. Missing arguments fall back to their
    /// declared default; a missing required argument without default is an error.
    pub fn render(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> crate::Result<String> {
        let mut rendered = self.content.clone();
        for arg in &self.arguments {
            let value = match arguments.get(&arg.name) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => match (&arg.default, arg.required) {
                    (Some(default), _) => default.clone(),
                    (None, true) => {
                        return Err(RelayError::Validation(
                            self.name.clone(),
                            format!("missing required prompt argument '{}'", arg.name),
                        ));
                    }
                    (None, false) => continue,
                },
            };
            rendered = rendered.replace(&format!("{{{{{}}}}}", arg.name), &value);
        }
        Ok(rendered)
    }
}

/// Credential accepted by one virtual server. Only the SHA-256 digest is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKeyRecord {
    /// Lowercase hex SHA-256 of the raw key.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Owning virtual server id.
    pub scope: String,
    #[serde(default)]
    pub revoked: bool,
}

impl ApiKeyRecord {
    pub fn new(raw_key: &str, scope: impl Into<String>, label: Option<String>) -> Self {
        Self {
            hash: hash_key(raw_key),
            label,
            scope: scope.into(),
            revoked: false,
        }
    }

    /// Constant-time comparison of the presented key's digest with this record.
    pub fn matches(&self, raw_key: &str) -> bool {
        digests_equal(&hash_key(raw_key), &self.hash)
    }
}

/// Hex-encoded SHA-256 digest of an API key.
pub fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Compare two secrets through their digests without early exit.
pub fn secrets_equal(presented: &str, expected: &str) -> bool {
    digests_equal(&hash_key(presented), &hash_key(expected))
}

fn digests_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A named, access-controlled aggregation of capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualServer {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tool_refs: Vec<CapabilityRef>,
    #[serde(default)]
    pub prompt_refs: Vec<CapabilityRef>,
    #[serde(default)]
    pub custom_prompts: Vec<InlinePrompt>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyRecord>,
}

impl VirtualServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            enabled: true,
            tool_refs: Vec::new(),
            prompt_refs: Vec::new(),
            custom_prompts: Vec::new(),
            api_keys: Vec::new(),
        }
    }

    pub fn with_tool(mut self, entry: &str, tool: &str) -> Self {
        let r = CapabilityRef::new(entry, tool);
        if !self.tool_refs.contains(&r) {
            self.tool_refs.push(r);
        }
        self
    }

    pub fn with_prompt(mut self, entry: &str, prompt: &str) -> Self {
        let r = CapabilityRef::new(entry, prompt);
        if !self.prompt_refs.contains(&r) {
            self.prompt_refs.push(r);
        }
        self
    }

    pub fn with_key(mut self, raw_key: &str) -> Self {
        let record = ApiKeyRecord::new(raw_key, self.id.clone(), None);
        self.api_keys.push(record);
        self
    }

    /// True if any tool or prompt ref points at `entry_id`.
    pub fn references(&self, entry_id: &str) -> bool {
        self.tool_refs
            .iter()
            .chain(self.prompt_refs.iter())
            .any(|r| r.entry == entry_id)
    }

    /// Distinct referenced entry ids, in first-reference order (tools first).
    pub fn referenced_entries(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for r in self.tool_refs.iter().chain(self.prompt_refs.iter()) {
            if !seen.contains(&r.entry.as_str()) {
                seen.push(r.entry.as_str());
            }
        }
        seen
    }

    pub fn validate(&self) -> crate::Result<()> {
        validate_slug(&self.id)?;
        if self.name.trim().is_empty() {
            return Err(RelayError::Validation(
                self.id.clone(),
                "virtual server requires a non-empty 'name'".to_string(),
            ));
        }
        if let Some(key) = self.api_keys.iter().find(|k| k.scope != self.id) {
            return Err(RelayError::Validation(
                self.id.clone(),
                format!("api key scoped to '{}' cannot be attached here", key.scope),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for prompt in &self.custom_prompts {
            if !names.insert(prompt.name.as_str()) {
                return Err(RelayError::Validation(
                    self.id.clone(),
                    format!("duplicate custom prompt '{}'", prompt.name),
                ));
            }
        }
        Ok(())
    }
}
