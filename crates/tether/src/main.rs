//! tether - drive MCP tool servers from the command line.

mod commands;

use clap::{Parser, Subcommand};
use commands::init_logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Multi-server MCP client", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "tether.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled server and print its status
    Servers,
    /// List a server's tools
    Tools {
        /// Server name
        server: String,
    },
    /// Call a tool
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Print progress notifications as they arrive
        #[arg(long)]
        stream: bool,
    },
    /// List a server's resources
    Resources {
        /// Server name
        server: String,
    },
    /// List a server's prompts
    Prompts {
        /// Server name
        server: String,
    },
    /// Sign in to an OAuth-protected server
    Auth {
        /// Server name
        server: String,
    },
    /// Revoke and remove stored OAuth tokens
    Logout {
        /// Server name
        server: String,
    },
    /// Start every server and report health events until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = commands::load_config(&cli.config).await?;

    match cli.command {
        Commands::Servers => commands::handle_servers(&config).await,
        Commands::Tools { server } => commands::handle_tools(&config, &server).await,
        Commands::Call {
            server,
            tool,
            args,
            stream,
        } => commands::handle_call(&config, &server, &tool, &args, stream).await,
        Commands::Resources { server } => commands::handle_resources(&config, &server).await,
        Commands::Prompts { server } => commands::handle_prompts(&config, &server).await,
        Commands::Auth { server } => commands::handle_auth(&config, &server).await,
        Commands::Logout { server } => commands::handle_logout(&config, &server).await,
        Commands::Watch => commands::handle_watch(&config).await,
    }
}
