//! Relay: virtual MCP server gateway.
//!
//! Subcommands:
//! - `relay serve`: HTTP gateway exposing every virtual server in the catalog
//! - `relay plugin-host`: MCP provider serving tool plugins from a directory
//! - `relay catalog list|check`: inspect or validate the catalog file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::Request;
use axum::response::IntoResponse;
use clap::{Parser, Subcommand};
use nimbus_relay::catalog::CatalogStore;
use nimbus_relay::{
    Catalog, FileStore, Gateway, PluginHostServer, PluginSet, RelayConfig, run_catalog_reload,
    run_hot_reload,
};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as TowerServiceExt;
use tracing_subscriber::EnvFilter;

/// Port for `plugin-host` when neither `--port` nor `PORT` is set.
const DEFAULT_PLUGIN_PORT: u16 = 3100;

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Relay: virtual MCP servers over remote, local and repo-backed providers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve every virtual server in the catalog over HTTP
    Serve {
        /// Path to relay.toml [default: ./relay.toml or ~/.config/relay/relay.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the listen port from the config
        #[arg(short, long)]
        port: Option<u16>,
        /// Override the bind address from the config
        #[arg(long)]
        host: Option<String>,
    },
    /// Serve the tool plugins in a directory as an MCP provider
    PluginHost {
        /// Directory holding one subdirectory per tool, each with a tool.toml
        #[arg(short, long)]
        dir: PathBuf,
        /// Listen port [default: $PORT, then 3100]
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Inspect the catalog
    Catalog {
        /// Path to relay.toml [default: ./relay.toml or ~/.config/relay/relay.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// List registry entries and virtual servers
    List,
    /// Validate the catalog and exit non-zero on errors
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down relay");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, port, host } => {
            let mut config = load_config(resolve_config(config)?.as_deref()).await?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            run_serve(config, cancel).await?;
        }
        Commands::PluginHost { dir, port, host } => {
            let port = match port {
                Some(port) => port,
                None => port_from_env()?,
            };
            run_plugin_host(dir, host, port, cancel).await?;
        }
        Commands::Catalog { config, action } => {
            let config = load_config(resolve_config(config)?.as_deref()).await?;
            run_catalog(&config, action).await?;
        }
    }

    Ok(())
}

/// Load the catalog, build the gateway, watch the catalog file, serve HTTP.
async fn run_serve(config: RelayConfig, cancel: CancellationToken) -> Result<()> {
    let store = Arc::new(
        FileStore::open(&config.gateway.catalog)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open catalog: {}", e))?,
    );
    let catalog = Catalog::new(store.clone());
    let gateway = Arc::new(
        Gateway::from_config(&config, catalog)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to build gateway: {}", e))?,
    );

    tokio::spawn(run_catalog_reload(
        store,
        gateway.clone(),
        cancel.child_token(),
    ));

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;
    tracing::info!(addr = %addr, "relay gateway listening");
    tracing::info!("virtual servers are at http://{}/mcp/<id>", addr);

    let served = nimbus_relay::server::serve(gateway.clone(), listener, cancel).await;
    gateway.shutdown().await;
    served.map_err(|e| anyhow::anyhow!("Relay HTTP server error: {}", e))?;
    Ok(())
}

/// Serve plugin tools over streamable HTTP MCP, reloading on directory changes.
async fn run_plugin_host(
    dir: PathBuf,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let plugins = PluginSet::discover(&dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load plugins from {:?}: {}", dir, e))?;
    tracing::info!(tools = plugins.len(), dir = %dir.display(), "plugins loaded");

    let server = PluginHostServer::new(plugins);
    tokio::spawn(run_hot_reload(
        dir.clone(),
        server.plugins_handle(),
        server.peers_handle(),
        cancel.child_token(),
    ));

    let session_manager = Arc::new(LocalSessionManager::default());
    let http_config = StreamableHttpServerConfig {
        cancellation_token: cancel.clone(),
        ..Default::default()
    };
    let server_for_factory = server.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(server_for_factory.clone()),
        session_manager,
        http_config,
    );

    let app = Router::new().fallback(move |req: Request<axum::body::Body>| {
        let svc = mcp_service.clone();
        async move {
            match svc.oneshot(req).await {
                Ok(response) => response.into_response(),
                Err(never) => match never {},
            }
        }
    });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;
    tracing::info!(addr = %addr, "plugin host listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("Plugin host error: {}", e))?;
    Ok(())
}

async fn run_catalog(config: &RelayConfig, action: CatalogAction) -> Result<()> {
    let store = FileStore::open(&config.gateway.catalog)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open catalog: {}", e))?;
    let doc = store
        .load()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load catalog: {}", e))?;

    match action {
        CatalogAction::List => {
            println!("entries:");
            for entry in &doc.entries {
                println!(
                    "  {:<24} {:<7} {:?}",
                    entry.id,
                    format!("{:?}", entry.kind).to_lowercase(),
                    entry.health.status
                );
            }
            println!("virtual servers:");
            for vs in &doc.virtual_servers {
                let live_keys = vs.api_keys.iter().filter(|k| !k.revoked).count();
                println!(
                    "  {:<24} {} tools, {} prompts, {} keys{}",
                    vs.id,
                    vs.tool_refs.len(),
                    vs.prompt_refs.len() + vs.custom_prompts.len(),
                    live_keys,
                    if vs.enabled { "" } else { " (disabled)" }
                );
            }
        }
        CatalogAction::Check => {
            doc.validate()
                .map_err(|e| anyhow::anyhow!("{}: {}", store.path().display(), e))?;
            let mut dangling = 0;
            for vs in &doc.virtual_servers {
                for entry in vs.referenced_entries() {
                    if doc.entry(entry).is_none() {
                        dangling += 1;
                        eprintln!("warning: '{}' references missing entry '{}'", vs.id, entry);
                    }
                }
            }
            println!(
                "{}: ok ({} entries, {} virtual servers, {} dangling references)",
                store.path().display(),
                doc.entries.len(),
                doc.virtual_servers.len(),
                dangling
            );
        }
    }
    Ok(())
}

/// The supervisor passes the allocated port in `PORT`.
fn port_from_env() -> Result<u16> {
    match std::env::var("PORT") {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", value, e)),
        Err(_) => Ok(DEFAULT_PLUGIN_PORT),
    }
}

/// Resolve config file path: explicit flag → ./relay.toml → ~/.config/relay/relay.toml.
/// `None` means no config file; built-in defaults apply.
fn resolve_config(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file {:?} does not exist", path));
        }
        return Ok(Some(path));
    }

    let local = Path::new("relay.toml");
    if local.exists() {
        return Ok(Some(local.to_path_buf()));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("relay").join("relay.toml");
        if xdg.exists() {
            return Ok(Some(xdg));
        }
    }

    tracing::info!("no relay.toml found, using defaults");
    Ok(None)
}

/// Load, parse and validate relay.toml, or return defaults when there is none.
async fn load_config(config_path: Option<&Path>) -> Result<RelayConfig> {
    let Some(config_path) = config_path else {
        return Ok(RelayConfig::default());
    };
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config: RelayConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", config_path, e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config {:?}: {}", config_path, e))?;
    Ok(config)
}
