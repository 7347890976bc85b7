//! Multi-server Model Context Protocol (MCP) client runtime.
//!
//! tether connects to many external tool servers at once, keeps each one
//! healthy, and exposes their tools, resources and prompts to a host
//! application.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │    host     │────▶│  McpClient   │────▶│ MCP servers │
//! │ application │◀────│  (registry)  │◀────│   (tools)   │
//! └─────────────┘     └──────▲───────┘     └─────────────┘
//!                            │ status / restart
//!                     ┌──────┴───────┐     ┌─────────────┐
//!                     │HealthMonitor │     │OAuthProvider│
//!                     └──────────────┘     └─────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: local servers via stdin/stdout, one JSON object per line
//! - **SSE**: remote servers via Server-Sent Events plus a POST endpoint
//! - **HTTP**: remote servers via one POST per request
//!
//! # Example
//!
//! ```no_run
//! use tether_mcp::{ClientSettings, McpClient, ServerConfig};
//!
//! # async fn example() -> Result<(), tether_mcp::McpError> {
//! let client = McpClient::new(ClientSettings::default());
//! client
//!     .start_server(
//!         "filesystem",
//!         ServerConfig::stdio("npx", ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]),
//!     )
//!     .await?;
//!
//! for tool in client.get_tools("filesystem").await? {
//!     println!("{}", tool.name);
//! }
//!
//! let result = client
//!     .call_tool("filesystem", "read_file", serde_json::json!({ "path": "/tmp/notes.txt" }))
//!     .await?;
//! println!("{}", result.text());
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod client;
pub mod config;
mod error;
pub mod health;
pub mod log;
pub mod oauth;
pub mod protocol;
pub mod transport;

pub use callback::OAuthCallbackServer;
pub use client::{McpClient, ServerStatus, ServerStatusInfo, ToolChunk};
pub use config::{
    ClientSettings, HealthConfig, McpConfigFile, OAuthConfig, ServerConfig, TransportKind,
};
pub use error::{McpError, McpResult};
pub use health::{HealthEvent, HealthMonitor, HealthPhase, HealthState, ServerRegistry};
pub use log::{LogEntry, LogSource, ServerLog};
pub use oauth::{AuthorizationRequest, OAuthProvider};
pub use protocol::{McpPrompt, McpResource, McpTool, ToolCallResult, ToolContent};
pub use tether_auth::{FileTokenStore, MemoryTokenStore, OAuthTokens, TokenStore};
pub use transport::{Transport, TransportFactory};
