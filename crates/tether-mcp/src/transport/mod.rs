//! MCP transport implementations.
//!
//! Three transports sit behind [`Transport`]:
//!
//! - [`StdioTransport`]: a local subprocess, one JSON object per line
//! - [`SseTransport`]: a Server-Sent Events stream plus a POST endpoint
//! - [`HttpTransport`]: one POST per request
//!
//! The client only branches on [`TransportKind`] when constructing one.

mod http;
mod pending;
mod sse;
mod stdio;

pub use http::HttpTransport;
pub use pending::PendingRequests;
pub use sse::{SseEvent, SseParser, SseTransport, DEFAULT_MAX_EVENT};
pub use stdio::{StdioTransport, DEFAULT_MAX_OUTPUT};

use crate::config::{ServerConfig, TransportKind};
use crate::error::{McpError, McpResult};
use crate::log::ServerLog;
use crate::protocol::{
    IncomingMessage, JsonRpcResponse, ProgressParams, METHOD_NOT_FOUND, METHOD_PROGRESS,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Receives progress notifications for a streaming request.
pub type ProgressSink = Arc<dyn Fn(ProgressParams) + Send + Sync>;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying channel.
    async fn connect(&self) -> McpResult<()>;

    /// Tear the channel down and reject everything in flight.
    async fn disconnect(&self) -> McpResult<()>;

    /// Send a request and wait up to `timeout` for the correlated response.
    ///
    /// A JSON-RPC error object is returned inside the response, not as `Err`.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<JsonRpcResponse>;

    /// Like [`Transport::request`], forwarding progress notifications to `sink`.
    async fn request_streaming(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        sink: ProgressSink,
    ) -> McpResult<JsonRpcResponse> {
        let _ = (method, params, timeout, sink);
        Err(McpError::Unsupported(format!(
            "{} transport does not stream",
            self.kind()
        )))
    }

    /// Whether `request_streaming` is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// Everything a transport needs beyond the server's config.
#[derive(Debug, Clone)]
pub struct TransportContext {
    /// Registered server name, for logging.
    pub server: String,
    /// Log shared with the server entry.
    pub log: ServerLog,
    /// Bearer token for remote transports.
    pub access_token: Option<String>,
    /// Environment with placeholders already resolved.
    pub env: HashMap<String, String>,
}

/// Builds transports for the client.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &ServerConfig,
        context: TransportContext,
    ) -> McpResult<Arc<dyn Transport>>;
}

/// Factory for the built-in transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        config: &ServerConfig,
        context: TransportContext,
    ) -> McpResult<Arc<dyn Transport>> {
        let missing = |field: &str| {
            McpError::invalid_config(
                &context.server,
                format!("{} transport requires a {field}", config.transport),
            )
        };

        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Stdio => {
                let command = config.command.clone().ok_or_else(|| missing("command"))?;
                Arc::new(StdioTransport::new(
                    context.server,
                    command,
                    config.args.clone(),
                    context.env,
                    context.log,
                ))
            }
            TransportKind::Sse => {
                let url = config.url.as_deref().ok_or_else(|| missing("url"))?;
                Arc::new(SseTransport::new(
                    context.server,
                    url,
                    config.headers.clone(),
                    context.access_token,
                    context.log,
                )?)
            }
            TransportKind::Http => {
                let url = config.url.as_deref().ok_or_else(|| missing("url"))?;
                Arc::new(HttpTransport::new(
                    context.server,
                    url,
                    config.headers.clone(),
                    context.access_token,
                    context.log,
                )?)
            }
        };
        Ok(transport)
    }
}

/// Route one inbound message.
///
/// Responses complete pending requests and progress notifications feed
/// streaming sinks. Server-initiated requests produce a reply the caller
/// must send back. Malformed or unmatched messages are logged and dropped.
pub(crate) fn dispatch_message(
    server: &str,
    text: &str,
    pending: &PendingRequests,
) -> Option<JsonRpcResponse> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let message = match IncomingMessage::parse(text) {
        Ok(message) => message,
        Err(reason) => {
            warn!(server = %server, reason = %reason, line = %truncate(text, 200), "Dropping malformed message");
            return None;
        }
    };

    match message {
        IncomingMessage::Response(response) => {
            let id = response.id;
            if !pending.complete(response) {
                warn!(server = %server, id, "Dropping response with unknown id");
            }
            None
        }
        IncomingMessage::Notification(notification) => {
            if notification.method == METHOD_PROGRESS {
                let params = notification
                    .params
                    .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok());
                match params {
                    Some(params) => {
                        if !pending.route_progress(params) {
                            debug!(server = %server, "Progress for a non-streaming request");
                        }
                    }
                    None => warn!(server = %server, "Dropping malformed progress notification"),
                }
            } else {
                debug!(server = %server, method = %notification.method, "Ignoring notification");
            }
            None
        }
        IncomingMessage::Request(request) => {
            let id = request.id?;
            debug!(server = %server, id, method = %request.method, "Server-initiated request");
            Some(if request.method == "ping" {
                JsonRpcResponse::success(id, Value::Object(serde_json::Map::new()))
            } else {
                JsonRpcResponse::failure(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", request.method),
                )
            })
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
