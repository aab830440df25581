//! Streamable-HTTP MCP client side.
//!
//! One short-lived session per operation: handshake, one request, cancel.

use rmcp::model::{CallToolRequestParams, GetPromptRequestParams};
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::{RoleClient, ServiceError, ServiceExt};
use serde_json::{Map, Value};

use crate::catalog::{PromptDescriptor, ProviderCapabilities, ToolDescriptor};
use crate::error::RelayError;

async fn connect(
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
) -> crate::Result<RunningService<RoleClient, ()>> {
    let mut config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
    if let Some(token) = credential {
        config = config.auth_header(token.to_string());
    }
    let transport = StreamableHttpClientTransport::from_config(config);
    ().serve(transport)
        .await
        .map_err(|e| classify_handshake_error(entry_id, &e.to_string()))
}

/// Connection-level failures are `Unreachable`; anything that got an answer
/// but not an MCP one is a `ProtocolMismatch`.
fn classify_handshake_error(entry_id: &str, message: &str) -> RelayError {
    let lower = message.to_lowercase();
    let unreachable = [
        "connect",
        "refused",
        "dns",
        "timed out",
        "error sending request",
        "closed",
        "reset",
    ]
    .iter()
    .any(|needle| lower.contains(needle));
    if unreachable {
        RelayError::Unreachable(entry_id.to_string(), message.to_string())
    } else {
        RelayError::ProtocolMismatch(entry_id.to_string(), message.to_string())
    }
}

fn map_service_error(entry_id: &str, err: ServiceError) -> RelayError {
    match err {
        ServiceError::McpError(data) => {
            RelayError::Upstream(entry_id.to_string(), data.message.to_string())
        }
        ServiceError::UnexpectedResponse => RelayError::ProtocolMismatch(
            entry_id.to_string(),
            "unexpected response type".to_string(),
        ),
        other => RelayError::Unreachable(entry_id.to_string(), other.to_string()),
    }
}

fn convert<T: serde::Serialize, U: serde::de::DeserializeOwned>(
    entry_id: &str,
    items: Vec<T>,
) -> crate::Result<Vec<U>> {
    items
        .into_iter()
        .map(|item| {
            serde_json::to_value(item)
                .and_then(serde_json::from_value)
                .map_err(|e| RelayError::ProtocolMismatch(entry_id.to_string(), e.to_string()))
        })
        .collect()
}

pub async fn list_capabilities(
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
) -> crate::Result<ProviderCapabilities> {
    let running = connect(entry_id, url, credential).await?;
    let peer = running.peer().clone();
    let advertises_prompts = peer
        .peer_info()
        .map(|info| info.capabilities.prompts.is_some())
        .unwrap_or(false);

    let outcome = async {
        let tools = peer
            .list_all_tools()
            .await
            .map_err(|e| map_service_error(entry_id, e))?;
        let tools: Vec<ToolDescriptor> = convert(entry_id, tools)?;

        let prompts: Vec<PromptDescriptor> = if advertises_prompts {
            match peer.list_all_prompts().await {
                Ok(prompts) => convert(entry_id, prompts)?,
                Err(e) => {
                    tracing::debug!(entry = %entry_id, error = %e, "prompt listing failed, treating as none");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Ok(ProviderCapabilities { tools, prompts })
    }
    .await;

    let _ = running.cancel().await;
    outcome
}

/// Invoke a tool. The provider's `CallToolResult` is returned as JSON, untouched.
/// Results flagged `isError` become `Upstream` errors carrying their text.
pub async fn call_tool(
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
    name: &str,
    arguments: Map<String, Value>,
) -> crate::Result<Value> {
    let running = connect(entry_id, url, credential).await?;
    let outcome = running
        .peer()
        .call_tool(CallToolRequestParams {
            name: name.to_string().into(),
            arguments: Some(arguments),
            task: None,
            meta: None,
        })
        .await
        .map_err(|e| map_service_error(entry_id, e));
    let _ = running.cancel().await;

    let result = outcome?;
    let is_error = result.is_error.unwrap_or(false);
    let value = serde_json::to_value(&result)
        .map_err(|e| RelayError::ProtocolMismatch(entry_id.to_string(), e.to_string()))?;
    if is_error {
        return Err(RelayError::Upstream(entry_id.to_string(), error_text(&value)));
    }
    Ok(value)
}

pub async fn get_prompt(
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
    name: &str,
    arguments: Map<String, Value>,
) -> crate::Result<Value> {
    let params: GetPromptRequestParams = serde_json::from_value(serde_json::json!({
        "name": name,
        "arguments": arguments,
    }))
    .map_err(|e| RelayError::Validation(name.to_string(), e.to_string()))?;

    let running = connect(entry_id, url, credential).await?;
    let outcome = running
        .peer()
        .get_prompt(params)
        .await
        .map_err(|e| map_service_error(entry_id, e));
    let _ = running.cancel().await;

    let result = outcome?;
    serde_json::to_value(&result)
        .map_err(|e| RelayError::ProtocolMismatch(entry_id.to_string(), e.to_string()))
}

/// Concatenated text content of an error result.
fn error_text(result: &Value) -> String {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        "tool reported an error".to_string()
    } else {
        texts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_handshake_error() {
        assert!(matches!(
            classify_handshake_error("a", "error sending request: connection refused"),
            RelayError::Unreachable(..)
        ));
        assert!(matches!(
            classify_handshake_error("a", "unexpected content type: text/html"),
            RelayError::ProtocolMismatch(..)
        ));
    }

    #[test]
    fn test_error_text() {
        let value = json!({"content": [{"type": "text", "text": "quota exceeded"}], "isError": true});
        assert_eq!(error_text(&value), "quota exceeded");
        assert_eq!(error_text(&json!({})), "tool reported an error");
    }
}
