//! Tool plugins for locally hosted providers.
//!
//! Each tool lives in its own directory with a `tool.toml` manifest. The host
//! serves the current snapshot over MCP and swaps in a fresh one when the
//! directory changes.

pub mod executor;
pub mod manifest;
pub mod server;
pub mod snapshot;

pub use manifest::{InputSpec, MANIFEST_FILE, PluginTool, ToolManifest};
pub use server::PluginHostServer;
pub use snapshot::{PluginSet, SharedPeers, SharedPluginSet, run_hot_reload};
