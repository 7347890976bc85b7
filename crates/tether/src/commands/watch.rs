//! Long-running health watch.

use super::{build_client, start_all};
use std::sync::Arc;
use tether_mcp::{HealthMonitor, McpConfigFile};
use tokio::sync::broadcast::error::RecvError;

/// Start every server, run the health monitor and print its events.
pub async fn handle_watch(config: &McpConfigFile) -> anyhow::Result<()> {
    let client = Arc::new(build_client(config)?);
    start_all(&client, config).await;

    let monitor = HealthMonitor::new(client.clone(), config.health.clone());
    let mut events = monitor.subscribe();
    monitor.start();
    println!(
        "Watching {} server(s). Press Ctrl-C to stop.",
        client.server_names().await.len()
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => println!("{} {event}", chrono::Local::now().format("%H:%M:%S")),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Health events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    monitor.stop();
    println!();
    for state in monitor.all_health_states().await {
        println!(
            "{:<20} {:<13} restarts={}",
            state.name,
            state.phase.to_string(),
            state.restart_attempts
        );
    }
    client.stop_all().await;
    Ok(())
}
