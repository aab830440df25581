//! Axum routes for virtual-server endpoints and gateway health.
//!
//! `POST /mcp/:server` carries one JSON-RPC message or a batch array.
//! JSON-RPC failures are reported inside a 200 response; only bodies that are
//! not JSON at all get a 400. The admin API is mounted under `/admin` when the
//! gateway has an admin token.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::gateway::Gateway;
use crate::server::admin;
use crate::router::JsonRpcResponse;

pub fn app(gateway: Arc<Gateway>) -> Router {
    let router = Router::new()
        .route("/mcp/:server", post(handle_rpc))
        .route("/health", get(health))
        .with_state(gateway.clone());
    match gateway.admin_token() {
        Some(token) => router.merge(admin::routes(gateway.clone(), token.to_string())),
        None => router,
    }
}

/// Serve until `cancel` fires.
pub async fn serve(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app(gateway))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

/// Key from `Authorization: Bearer` or `X-Api-Key`.
fn presented_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());
    bearer.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    })
}

async fn handle_rpc(
    State(gateway): State<Arc<Gateway>>,
    Path(server): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(server = %server, error = %e, "unparseable request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::parse_error(e.to_string())),
            )
                .into_response();
        }
    };
    let key = presented_key(&headers);
    match message {
        Value::Array(batch) => {
            let responses = gateway
                .router()
                .handle_batch(&server, key.as_deref(), batch)
                .await;
            Json(responses).into_response()
        }
        message => {
            let response = gateway
                .router()
                .handle(&server, key.as_deref(), message)
                .await;
            Json(response).into_response()
        }
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.health().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogDocument, ProviderTransport, RegistryEntry, VirtualServer};
    use crate::config::RelayConfig;
    use crate::test_support::spawn_provider;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn gateway(url: String) -> Arc<Gateway> {
        let catalog = Catalog::in_memory(CatalogDocument::default());
        catalog
            .add(RegistryEntry::remote("intel", url, ProviderTransport::Jsonrpc))
            .await
            .unwrap();
        catalog
            .put_virtual_server(
                VirtualServer::new("vs1", "One")
                    .with_tool("intel", "scan")
                    .with_key("k1"),
            )
            .await
            .unwrap();
        let mut config = RelayConfig::default();
        config.supervisor.port_range_start = 47600;
        config.supervisor.port_range_end = 47609;
        Arc::new(Gateway::from_config(&config, catalog).await.unwrap())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn rpc(key_header: Option<(&str, &str)>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/mcp/vs1")
            .header("content-type", "application/json");
        if let Some((name, value)) = key_header {
            builder = builder.header(name, value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_presented_key_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(presented_key(&headers), None);
        headers.insert("x-api-key", "k2".parse().unwrap());
        assert_eq!(presented_key(&headers).as_deref(), Some("k2"));
        headers.insert(header::AUTHORIZATION, "Bearer k1".parse().unwrap());
        assert_eq!(presented_key(&headers).as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_execute_over_http_with_bearer() {
        let provider = spawn_provider(&["scan"], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"tools.execute","params":{"tool_id":"scan","params":{"url":"https://example.com"}}}"#;

        let response = app
            .oneshot(rpc(Some(("authorization", "Bearer k1")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["result"]["echo"]["url"], "https://example.com");
    }

    #[tokio::test]
    async fn test_auth_error_is_jsonrpc_error_with_200() {
        let provider = spawn_provider(&["scan"], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let body = r#"{"jsonrpc":"2.0","id":2,"method":"tools.list"}"#;

        let response = app
            .oneshot(rpc(Some(("x-api-key", "nope")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["error"]["data"]["kind"], "AuthError");
        assert_eq!(value["id"], 2);
        assert_eq!(provider.list_count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_body_is_400() {
        let provider = spawn_provider(&[], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let response = app.oneshot(rpc(None, "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert_eq!(value["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_batch_answers_each_member_in_order() {
        let provider = spawn_provider(&["scan"], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let body = r#"[
            {"jsonrpc":"2.0","id":"a","method":"tools.list"},
            {"jsonrpc":"2.0","id":"b","method":"nope"},
            {"jsonrpc":"2.0","id":"c","method":"tools.execute","params":{"tool_id":"scan","params":{"url":"u"}}}
        ]"#;

        let response = app
            .oneshot(rpc(Some(("x-api-key", "k1")), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        let members = value.as_array().unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0]["id"], "a");
        assert_eq!(members[0]["result"]["tools"][0]["name"], "intel__scan");
        assert_eq!(members[1]["id"], "b");
        assert_eq!(members[1]["error"]["code"], -32601);
        assert_eq!(members[2]["id"], "c");
        assert_eq!(members[2]["result"]["echo"]["url"], "u");
    }

    #[tokio::test]
    async fn test_empty_batch_is_invalid_request() {
        let provider = spawn_provider(&["scan"], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let response = app
            .oneshot(rpc(Some(("x-api-key", "k1")), "[]"))
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value[0]["error"]["code"], -32600);
        assert_eq!(provider.list_count(), 0);
    }

    #[tokio::test]
    async fn test_admin_routes_absent_without_token() {
        let provider = spawn_provider(&[], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/servers")
                    .header("authorization", "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let provider = spawn_provider(&[], Duration::ZERO).await;
        let app = app(gateway(provider.url()).await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["entries"][0]["id"], "intel");
        assert_eq!(value["ports_available"], 10);
        assert_eq!(value["ports_total"], 10);
    }
}
