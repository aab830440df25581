//! Gateway scenarios over the public API: partial listings, key revocation
//! while a call is in flight, and authentication ahead of any process start.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use nimbus_relay::{
    Catalog, CatalogDocument, Gateway, ProviderTransport, RegistryEntry, RelayConfig,
    VirtualServer,
};
use serde_json::{Value, json};

#[derive(Clone)]
struct Provider {
    tools: Vec<&'static str>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

async fn rpc(State(p): State<Provider>, Json(body): Json<Value>) -> Json<Value> {
    tokio::time::sleep(p.delay).await;
    let id = body["id"].clone();
    let result = match body["method"].as_str() {
        Some("tools/list") => json!({
            "tools": p.tools.iter().map(|t| json!({"name": t, "inputSchema": {"type": "object"}})).collect::<Vec<_>>()
        }),
        Some("tools/call") => {
            p.calls.fetch_add(1, Ordering::SeqCst);
            json!({"scanned": body["params"]["arguments"]["url"].clone()})
        }
        _ => {
            return Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "no"}}));
        }
    };
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn provider(tools: Vec<&'static str>, delay: Duration) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/rpc", post(rpc)).with_state(Provider {
        tools,
        delay,
        calls: calls.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/rpc", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (url, calls)
}

fn unused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    format!("http://{}/rpc", listener.local_addr().unwrap())
}

fn config(port_base: u16) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.gateway.per_entry_timeout_ms = 1000;
    config.supervisor.port_range_start = port_base;
    config.supervisor.port_range_end = port_base + 9;
    config
}

async fn gateway(entries: Vec<RegistryEntry>, vs: VirtualServer, port_base: u16) -> Arc<Gateway> {
    let catalog = Catalog::in_memory(CatalogDocument::default());
    for entry in entries {
        catalog.add(entry).await.unwrap();
    }
    catalog.put_virtual_server(vs).await.unwrap();
    Arc::new(Gateway::from_config(&config(port_base), catalog).await.unwrap())
}

fn call(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params})
}

#[tokio::test]
async fn test_unreachable_provider_never_fails_listing() {
    let (url, _) = provider(vec!["scan", "whois"], Duration::ZERO).await;
    let vs = VirtualServer::new("vs1", "Intel")
        .with_tool("up", "scan")
        .with_tool("up", "whois")
        .with_tool("down", "lookup")
        .with_key("k1");
    let gateway = gateway(
        vec![
            RegistryEntry::remote("up", url, ProviderTransport::Jsonrpc),
            RegistryEntry::remote("down", unused_url(), ProviderTransport::Jsonrpc),
        ],
        vs,
        47900,
    )
    .await;

    let response = gateway
        .router()
        .handle("vs1", Some("k1"), call("tools.list", json!({})))
        .await;
    assert!(response.error.is_none(), "{:?}", response.error);
    let names: Vec<String> = response.result.unwrap()["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["up__scan", "up__whois"]);
}

#[tokio::test]
async fn test_revocation_applies_to_next_call_not_in_flight_one() {
    let (url, calls) = provider(vec!["scan"], Duration::from_millis(300)).await;
    let vs = VirtualServer::new("vs1", "Intel")
        .with_tool("up", "scan")
        .with_key("k1");
    let gateway = gateway(
        vec![RegistryEntry::remote("up", url, ProviderTransport::Jsonrpc)],
        vs,
        47910,
    )
    .await;

    let in_flight = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .router()
                .handle(
                    "vs1",
                    Some("k1"),
                    call("tools.execute", json!({"tool_id": "scan", "params": {"url": "a"}})),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway.catalog().revoke_api_key("vs1", "k1").await.unwrap();

    let next = gateway
        .router()
        .handle(
            "vs1",
            Some("k1"),
            call("tools.execute", json!({"tool_id": "scan", "params": {"url": "b"}})),
        )
        .await;
    assert_eq!(next.error.unwrap().data.kind, "AuthError");

    let finished = in_flight.await.unwrap();
    assert_eq!(finished.result.unwrap()["scanned"], "a");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_key_never_spawns_local_provider() {
    let workdir = tempfile::tempdir().unwrap();
    let marker = workdir.path().join("started");
    let mut entry = RegistryEntry::local(
        "entryA",
        "sh",
        vec![
            "-c".to_string(),
            format!("touch {} && exec sleep 30", marker.display()),
        ],
    );
    if let Some(local) = entry.local.as_mut() {
        local.cwd = Some(workdir.path().to_path_buf());
    }
    let vs = VirtualServer::new("vs1", "Local")
        .with_tool("entryA", "scan")
        .with_key("k1");
    let gateway = gateway(vec![entry], vs, 47920).await;

    for key in [Some("wrong"), None] {
        let response = gateway
            .router()
            .handle(
                "vs1",
                key,
                call(
                    "tools.execute",
                    json!({"tool_id": "scan", "params": {"url": "https://example.com"}}),
                ),
            )
            .await;
        assert_eq!(response.error.unwrap().data.kind, "AuthError");
    }
    assert_eq!(gateway.supervisor().spawn_count(), 0);
    assert!(gateway.supervisor().processes().await.is_empty());
    assert!(!marker.exists());
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_disabled_virtual_server_rejects_valid_key() {
    let (url, calls) = provider(vec!["scan"], Duration::ZERO).await;
    let mut vs = VirtualServer::new("vs1", "Intel")
        .with_tool("up", "scan")
        .with_key("k1");
    vs.enabled = false;
    let gateway = gateway(
        vec![RegistryEntry::remote("up", url, ProviderTransport::Jsonrpc)],
        vs,
        47930,
    )
    .await;
    let response = gateway
        .router()
        .handle("vs1", Some("k1"), call("tools.list", json!({})))
        .await;
    let error = response.error.unwrap();
    assert_eq!(error.data.kind, "AuthError");
    assert_eq!(error.data.cause, "disabled");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
