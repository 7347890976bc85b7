//! OAuth sign-in and sign-out.

use super::{oauth_provider, server_config};
use tether_mcp::{McpConfigFile, OAuthConfig};

fn oauth_config<'a>(config: &'a McpConfigFile, server: &str) -> anyhow::Result<&'a OAuthConfig> {
    server_config(config, server)?
        .oauth
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Server '{server}' does not have OAuth configured"))
}

/// Run the browser flow for a server.
pub async fn handle_auth(config: &McpConfigFile, server: &str) -> anyhow::Result<()> {
    let oauth = oauth_config(config, server)?;
    let provider = oauth_provider()?;

    if provider.get_access_token(server, oauth).await?.is_some() {
        println!("✓ Already signed in to '{server}'");
        return Ok(());
    }

    println!("Opening your browser to sign in to '{server}'...");
    println!("Waiting for authorization (press Ctrl-C to cancel).");
    let tokens = provider.authenticate(server, oauth).await?;

    println!("✓ Signed in to '{server}'");
    if let Some(scope) = &tokens.scope {
        println!("  Scope: {scope}");
    }
    Ok(())
}

/// Revoke and forget a server's tokens.
pub async fn handle_logout(config: &McpConfigFile, server: &str) -> anyhow::Result<()> {
    let oauth = oauth_config(config, server)?;
    let provider = oauth_provider()?;

    if !provider.has_tokens(server).await {
        println!("No stored credentials for '{server}'");
        return Ok(());
    }
    provider.revoke_access(server, oauth).await?;
    println!("✓ Signed out of '{server}'");
    Ok(())
}
