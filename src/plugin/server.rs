//! PluginHostServer: rmcp `ServerHandler` over the current plugin snapshot.
//!
//! Served over streamable HTTP by `relay plugin-host`, which is how a local
//! catalog entry usually runs. Every session clone shares the same outer
//! `Arc`s, so a reload is visible to all sessions on their next call.

use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{NotificationContext, RequestContext, RoleServer};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::error::RelayError;
use crate::plugin::executor;
use crate::plugin::snapshot::{PluginSet, SharedPeers, SharedPluginSet};

#[derive(Clone)]
pub struct PluginHostServer {
    plugins: SharedPluginSet,
    peers: SharedPeers,
}

impl PluginHostServer {
    pub fn new(plugins: PluginSet) -> Self {
        Self {
            plugins: Arc::new(RwLock::new(Arc::new(plugins))),
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn plugins_handle(&self) -> SharedPluginSet {
        self.plugins.clone()
    }

    pub fn peers_handle(&self) -> SharedPeers {
        self.peers.clone()
    }

    async fn snapshot(&self) -> Arc<PluginSet> {
        self.plugins.read().await.clone()
    }

    /// Run one tool and wrap its value as `{<output>: value}`.
    pub async fn run_tool(&self, name: &str, arguments: Map<String, Value>) -> crate::Result<Value> {
        let snapshot = self.snapshot().await;
        let tool = snapshot
            .get(name)
            .ok_or_else(|| RelayError::CapabilityNotFound(name.to_string()))?;
        let value = executor::invoke(&tool, arguments).await?;
        let mut wrapped = Map::new();
        wrapped.insert(tool.manifest.output.clone(), value);
        Ok(Value::Object(wrapped))
    }

    async fn tools(&self) -> Result<Vec<Tool>, McpError> {
        self.snapshot()
            .await
            .descriptors()
            .into_iter()
            .map(|d| {
                serde_json::to_value(d)
                    .and_then(serde_json::from_value)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))
            })
            .collect()
    }
}

impl ServerHandler for PluginHostServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "relay-plugin-host".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some("Runs tool plugins discovered from a directory.".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tools().await?,
            next_cursor: None,
            meta: None,
        })
    }

    /// Tool failures come back as `isError` results; unknown tools and bad
    /// arguments are protocol errors.
    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        match self.run_tool(&request.name, arguments).await {
            Ok(wrapped) => Ok(CallToolResult {
                content: vec![Content::json(wrapped.clone())?],
                structured_content: Some(wrapped),
                is_error: Some(false),
                meta: None,
            }),
            Err(RelayError::CapabilityNotFound(name)) => Err(McpError::invalid_params(
                format!("unknown tool '{}'", name),
                None,
            )),
            Err(e @ RelayError::Validation(..)) => {
                Err(McpError::invalid_params(e.to_string(), None))
            }
            Err(e) => Ok(CallToolResult {
                content: vec![Content::text(e.to_string())],
                structured_content: None,
                is_error: Some(true),
                meta: None,
            }),
        }
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        tracing::debug!("plugin host client initialized");
        self.peers.lock().await.push(context.peer.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::MANIFEST_FILE;
    use serde_json::json;
    use std::path::Path;

    fn write_tool(root: &Path, name: &str, output: &str, script: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), script).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!(
                "name = \"{}\"\noutput = \"{}\"\ncommand = \"sh\"\nargs = [\"run.sh\"]\ntimeout_secs = 5\n\n[[inputs]]\nname = \"url\"\nrequired = true\n",
                name, output
            ),
        )
        .unwrap();
    }

    async fn host(root: &Path) -> PluginHostServer {
        PluginHostServer::new(PluginSet::discover(root).await.unwrap())
    }

    #[test]
    fn test_get_info() {
        let server = PluginHostServer::new(PluginSet::default());
        let info = server.get_info();
        assert_eq!(info.server_info.name, "relay-plugin-host");
        assert!(info.capabilities.tools.is_some());
    }

    #[tokio::test]
    async fn test_tools_converted_from_manifests() {
        let root = tempfile::tempdir().unwrap();
        write_tool(root.path(), "scan", "result", "cat");
        let tools = host(root.path()).await.tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "scan");
        let schema = serde_json::to_value(&tools[0].input_schema).unwrap();
        assert_eq!(schema["required"], json!(["url"]));
    }

    #[tokio::test]
    async fn test_run_tool_wraps_declared_output_key() {
        let root = tempfile::tempdir().unwrap();
        write_tool(
            root.path(),
            "scan",
            "result",
            "read line; printf '{\"result\": {\"seen\": %s}}' \"$line\"",
        );
        let mut args = Map::new();
        args.insert("url".to_string(), json!("https://example.com"));
        let value = host(root.path()).await.run_tool("scan", args).await.unwrap();
        assert_eq!(value, json!({"result": {"seen": {"url": "https://example.com"}}}));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let root = tempfile::tempdir().unwrap();
        let result = host(root.path()).await.run_tool("nope", Map::new()).await;
        assert!(matches!(result, Err(RelayError::CapabilityNotFound(_))));
    }
}
