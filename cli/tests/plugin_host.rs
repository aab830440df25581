//! End to end: the gateway starts `relay plugin-host` as a local provider on
//! demand and forwards calls to a plugin tool over MCP.

use std::path::Path;
use std::sync::Arc;

use nimbus_relay::{Catalog, CatalogDocument, Gateway, RegistryEntry, RelayConfig, VirtualServer};
use serde_json::{Value, json};

fn write_scan_tool(root: &Path) {
    let dir = root.join("scan");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("run.sh"),
        "read line\nprintf '{\"result\": {\"scanned\": %s, \"verdict\": \"clean\"}}' \"$line\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("tool.toml"),
        r#"
name = "scan"
description = "Scan a URL"
output = "result"
command = "sh"
args = ["run.sh"]
timeout_secs = 10

[[inputs]]
name = "url"
required = true
"#,
    )
    .unwrap();
}

async fn gateway(plugins: &Path) -> Gateway {
    let catalog = Catalog::in_memory(CatalogDocument::default());
    catalog
        .add(RegistryEntry::local(
            "entryA",
            env!("CARGO_BIN_EXE_relay"),
            vec![
                "plugin-host".to_string(),
                "--dir".to_string(),
                plugins.display().to_string(),
            ],
        ))
        .await
        .unwrap();
    catalog
        .put_virtual_server(
            VirtualServer::new("vs1", "Scanner")
                .with_tool("entryA", "scan")
                .with_key("k1"),
        )
        .await
        .unwrap();

    let mut config = RelayConfig::default();
    config.supervisor.port_range_start = 47800;
    config.supervisor.port_range_end = 47809;
    Gateway::from_config(&config, catalog).await.unwrap()
}

fn execute(url: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools.execute",
        "params": { "tool_id": "scan", "params": { "url": url } }
    })
}

#[tokio::test]
async fn test_execute_spawns_plugin_host_once() {
    let plugins = tempfile::tempdir().unwrap();
    write_scan_tool(plugins.path());
    let gateway = Arc::new(gateway(plugins.path()).await);

    // A bad key never reaches the supervisor.
    let denied = gateway
        .router()
        .handle("vs1", Some("wrong"), execute("https://example.com"))
        .await;
    assert_eq!(denied.error.unwrap().data.kind, "AuthError");
    assert_eq!(gateway.supervisor().spawn_count(), 0);

    // Concurrent first calls collapse into one spawn.
    let calls = (0..4).map(|_| {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .router()
                .handle("vs1", Some("k1"), execute("https://example.com"))
                .await
        })
    });
    for response in collect_responses(calls).await {
        assert!(response.error.is_none(), "{:?}", response.error);
        let result = response.result.unwrap();
        assert_eq!(
            result["structuredContent"]["result"],
            json!({"scanned": {"url": "https://example.com"}, "verdict": "clean"})
        );
    }
    assert_eq!(gateway.supervisor().spawn_count(), 1);

    let listed = gateway
        .router()
        .handle("vs1", Some("k1"), json!({"id": 2, "method": "tools.list"}))
        .await
        .result
        .unwrap();
    assert_eq!(listed["tools"][0]["name"], "entryA__scan");

    gateway.shutdown().await;
}

async fn collect_responses<I>(handles: I) -> Vec<nimbus_relay::JsonRpcResponse>
where
    I: Iterator<Item = tokio::task::JoinHandle<nimbus_relay::JsonRpcResponse>>,
{
    let mut out = Vec::new();
    for handle in handles.collect::<Vec<_>>() {
        out.push(handle.await.unwrap());
    }
    out
}
