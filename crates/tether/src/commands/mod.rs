//! Command handlers for the tether CLI.

pub mod auth;
pub mod logging;
pub mod servers;
pub mod watch;

pub use auth::*;
pub use logging::*;
pub use servers::*;
pub use watch::*;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tether_auth::FileTokenStore;
use tether_mcp::{McpClient, McpConfigFile, OAuthProvider, ServerConfig};

/// Load the configuration file, or an empty configuration if it is missing.
pub async fn load_config(path: &Path) -> anyhow::Result<McpConfigFile> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No configuration file, using defaults");
        return Ok(McpConfigFile::default());
    }
    McpConfigFile::load(path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Shared OAuth provider backed by the token file.
pub fn oauth_provider() -> anyhow::Result<Arc<OAuthProvider>> {
    let store = FileTokenStore::new().context("Could not locate the token store")?;
    Ok(Arc::new(OAuthProvider::new(Arc::new(store))))
}

/// Client configured from the file, with OAuth support.
pub fn build_client(config: &McpConfigFile) -> anyhow::Result<McpClient> {
    Ok(McpClient::new(config.client_settings()).with_oauth(oauth_provider()?))
}

/// Look up a server by name.
pub fn server_config<'a>(config: &'a McpConfigFile, name: &str) -> anyhow::Result<&'a ServerConfig> {
    config
        .mcp_servers
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("Server '{name}' is not configured"))
}

/// Start one server and return a client holding it.
pub async fn connect_one(config: &McpConfigFile, name: &str) -> anyhow::Result<McpClient> {
    let server = server_config(config, name)?.clone();
    let client = build_client(config)?;
    client.start_server(name, server).await?;
    Ok(client)
}

/// Start every enabled server concurrently. Failures are logged, not returned.
pub async fn start_all(client: &McpClient, config: &McpConfigFile) {
    let starts = config
        .enabled_servers()
        .into_iter()
        .map(|(name, server)| async move {
            if let Err(e) = client.start_server(&name, server).await {
                tracing::warn!(server = %name, error = %e, "Server failed to start");
            }
        });
    futures::future::join_all(starts).await;
}

/// Shorten `text` to `max` characters.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
