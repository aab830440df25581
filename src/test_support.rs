//! In-process JSON-RPC provider used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::Mutex;

#[derive(Clone)]
struct ProviderState {
    tools: Vec<String>,
    delay: Duration,
    list_calls: Arc<AtomicUsize>,
    tool_calls: Arc<AtomicUsize>,
    auth_seen: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct MockProvider {
    pub base: String,
    pub list_calls: Arc<AtomicUsize>,
    pub tool_calls: Arc<AtomicUsize>,
    pub auth_seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockProvider {
    /// JSON-RPC endpoint.
    pub fn url(&self) -> String {
        format!("{}/rpc", self.base)
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }
}

async fn rpc(
    State(state): State<ProviderState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.auth_seen.lock().await.push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let params = body.get("params").cloned().unwrap_or(json!({}));
    let result = match body.get("method").and_then(Value::as_str) {
        Some("tools/list") => {
            state.list_calls.fetch_add(1, Ordering::SeqCst);
            let tools: Vec<Value> = state
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t,
                        "description": format!("{} tool", t),
                        "inputSchema": {"type": "object", "properties": {}}
                    })
                })
                .collect();
            json!({ "tools": tools })
        }
        Some("tools/call") => {
            state.tool_calls.fetch_add(1, Ordering::SeqCst);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            if name == "explode" {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "provider blew up"}
                }));
            }
            json!({
                "tool": name,
                "echo": params.get("arguments").cloned().unwrap_or(json!({})),
                "content": [{"type": "text", "text": format!("ran {}", name)}]
            })
        }
        _ => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "method not found"}
            }));
        }
    };
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

async fn html() -> &'static str {
    "<html>not json-rpc</html>"
}

/// Serve a JSON-RPC provider exposing `tools` on `127.0.0.1:0`.
pub async fn spawn_provider(tools: &[&str], delay: Duration) -> MockProvider {
    let state = ProviderState {
        tools: tools.iter().map(|t| t.to_string()).collect(),
        delay,
        list_calls: Arc::new(AtomicUsize::new(0)),
        tool_calls: Arc::new(AtomicUsize::new(0)),
        auth_seen: Arc::new(Mutex::new(Vec::new())),
    };
    let provider = MockProvider {
        base: String::new(),
        list_calls: state.list_calls.clone(),
        tool_calls: state.tool_calls.clone(),
        auth_seen: state.auth_seen.clone(),
    };
    let app = Router::new()
        .route("/rpc", post(rpc))
        .route("/html", post(html))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockProvider {
        base: format!("http://{}", addr),
        ..provider
    }
}

/// A URL on which nothing listens.
pub fn dead_url() -> String {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    format!("http://127.0.0.1:{}/rpc", port)
}
