//! Plain JSON-RPC 2.0 over HTTP POST, for providers without an MCP session layer.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value, json};

use crate::catalog::{PromptDescriptor, ProviderCapabilities, ToolDescriptor};
use crate::error::RelayError;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// POST one JSON-RPC request and return its `result`.
pub async fn request(
    http: &reqwest::Client,
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
    method: &str,
    params: Value,
) -> crate::Result<Value> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": NEXT_ID.fetch_add(1, Ordering::Relaxed),
        "method": method,
        "params": params,
    });
    let mut req = http.post(url).json(&body);
    if let Some(token) = credential {
        req = req.bearer_auth(token);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| RelayError::Unreachable(entry_id.to_string(), e.to_string()))?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| RelayError::Unreachable(entry_id.to_string(), e.to_string()))?;

    let value: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(_) if status.is_server_error() => {
            return Err(RelayError::Upstream(
                entry_id.to_string(),
                format!("HTTP {}", status),
            ));
        }
        Err(_) => {
            return Err(RelayError::ProtocolMismatch(
                entry_id.to_string(),
                format!("HTTP {} with a non-JSON body", status),
            ));
        }
    };

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(RelayError::Upstream(entry_id.to_string(), message));
    }
    value.get("result").cloned().ok_or_else(|| {
        RelayError::ProtocolMismatch(
            entry_id.to_string(),
            "response carries neither 'result' nor 'error'".to_string(),
        )
    })
}

pub async fn list_capabilities(
    http: &reqwest::Client,
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
) -> crate::Result<ProviderCapabilities> {
    let result = request(http, entry_id, url, credential, "tools/list", json!({})).await?;
    let tools: Vec<ToolDescriptor> = field_list(entry_id, &result, "tools")?;

    // Providers without prompt support answer prompts/list with an error.
    let prompts: Vec<PromptDescriptor> =
        match request(http, entry_id, url, credential, "prompts/list", json!({})).await {
            Ok(result) => field_list(entry_id, &result, "prompts")?,
            Err(RelayError::Upstream(..)) => Vec::new(),
            Err(e) => return Err(e),
        };

    Ok(ProviderCapabilities { tools, prompts })
}

pub async fn call_tool(
    http: &reqwest::Client,
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
    name: &str,
    arguments: Map<String, Value>,
) -> crate::Result<Value> {
    request(
        http,
        entry_id,
        url,
        credential,
        "tools/call",
        json!({ "name": name, "arguments": arguments }),
    )
    .await
}

pub async fn get_prompt(
    http: &reqwest::Client,
    entry_id: &str,
    url: &str,
    credential: Option<&str>,
    name: &str,
    arguments: Map<String, Value>,
) -> crate::Result<Value> {
    request(
        http,
        entry_id,
        url,
        credential,
        "prompts/get",
        json!({ "name": name, "arguments": arguments }),
    )
    .await
}

fn field_list<T: serde::de::DeserializeOwned>(
    entry_id: &str,
    result: &Value,
    field: &str,
) -> crate::Result<Vec<T>> {
    let items = result.get(field).cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(items).map_err(|e| {
        RelayError::ProtocolMismatch(entry_id.to_string(), format!("bad '{}' list: {}", field, e))
    })
}
