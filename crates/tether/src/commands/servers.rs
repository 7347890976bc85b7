//! Server inspection and tool call commands.

use super::{build_client, connect_one, start_all, truncate};
use tether_mcp::{McpConfigFile, ToolChunk};

/// Start every enabled server and print a status table.
pub async fn handle_servers(config: &McpConfigFile) -> anyhow::Result<()> {
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    let client = build_client(config)?;
    start_all(&client, config).await;

    println!(
        "{:<20} {:<13} {:<6} {:>5}  {}",
        "NAME", "STATUS", "TYPE", "TOOLS", "DETAIL"
    );
    println!("{}", "-".repeat(72));

    for (name, server) in &config.enabled_servers() {
        // Discover tools so the count is meaningful.
        let _ = client.get_tools(name).await;
        let info = client.get_server_status(name).await;
        let detail = match (&info.error, &info.server_info) {
            (Some(error), _) => truncate(error, 40),
            (None, Some(server_info)) => match &server_info.version {
                Some(version) => format!("{} {version}", server_info.name),
                None => server_info.name.clone(),
            },
            (None, None) => String::new(),
        };
        println!(
            "{:<20} {:<13} {:<6} {:>5}  {}",
            name,
            info.status.to_string(),
            server.transport.to_string(),
            info.tool_count,
            detail
        );
    }

    let disabled: Vec<_> = config
        .mcp_servers
        .iter()
        .filter(|(_, c)| !c.enabled)
        .map(|(n, _)| n.as_str())
        .collect();
    if !disabled.is_empty() {
        println!();
        println!("Disabled: {}", disabled.join(", "));
    }

    client.stop_all().await;
    Ok(())
}

/// List a server's tools.
pub async fn handle_tools(config: &McpConfigFile, server: &str) -> anyhow::Result<()> {
    let client = connect_one(config, server).await?;
    let result = client.get_tools(server).await;
    client.stop_all().await;
    let tools = result?;

    if tools.is_empty() {
        println!("'{server}' exposes no tools.");
        return Ok(());
    }
    for tool in tools {
        let description = tool.description.as_deref().unwrap_or("");
        println!("{:<30} {}", tool.name, truncate(description, 60));
    }
    Ok(())
}

/// Call a tool and print its text output.
pub async fn handle_call(
    config: &McpConfigFile,
    server: &str,
    tool: &str,
    args: &str,
    stream: bool,
) -> anyhow::Result<()> {
    let arguments: serde_json::Value = serde_json::from_str(args)
        .map_err(|e| anyhow::anyhow!("--args must be a JSON object: {e}"))?;
    if !arguments.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }

    let client = connect_one(config, server).await?;
    let result = if stream {
        client
            .call_tool_streaming(server, tool, arguments, |chunk| {
                if let ToolChunk::Progress(progress) = chunk {
                    let amount = match (progress.progress, progress.total) {
                        (Some(done), Some(total)) => format!("{done}/{total}"),
                        (Some(done), None) => format!("{done}"),
                        _ => String::from("?"),
                    };
                    eprintln!(
                        "[progress {amount}] {}",
                        progress.message.unwrap_or_default()
                    );
                }
            })
            .await
    } else {
        client.call_tool(server, tool, arguments).await
    };
    client.stop_all().await;
    let result = result?;

    println!("{}", result.text());
    if result.is_error {
        anyhow::bail!("Tool '{tool}' reported an error");
    }
    Ok(())
}

/// List a server's resources.
pub async fn handle_resources(config: &McpConfigFile, server: &str) -> anyhow::Result<()> {
    let client = connect_one(config, server).await?;
    let result = client.get_resources(server).await;
    client.stop_all().await;

    for resource in result? {
        println!(
            "{:<40} {:<20} {}",
            resource.uri,
            resource.mime_type.as_deref().unwrap_or("-"),
            resource.name
        );
    }
    Ok(())
}

/// List a server's prompts.
pub async fn handle_prompts(config: &McpConfigFile, server: &str) -> anyhow::Result<()> {
    let client = connect_one(config, server).await?;
    let result = client.get_prompts(server).await;
    client.stop_all().await;

    for prompt in result? {
        let args: Vec<_> = prompt
            .arguments
            .iter()
            .map(|a| {
                if a.required {
                    a.name.clone()
                } else {
                    format!("[{}]", a.name)
                }
            })
            .collect();
        println!(
            "{:<25} {:<25} {}",
            prompt.name,
            args.join(" "),
            truncate(prompt.description.as_deref().unwrap_or(""), 50)
        );
    }
    Ok(())
}
