//! MCP error types.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// MCP integration is globally disabled.
    #[error("MCP integration is disabled")]
    Disabled,

    /// A server with this name is already registered.
    #[error("Server already registered: {0}")]
    AlreadyRegistered(String),

    /// Server configuration is missing a required field or is malformed.
    #[error("Invalid configuration for server '{server}': {message}")]
    InvalidConfig { server: String, message: String },

    /// Server not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Server is registered but not in the `connected` state.
    #[error("Server '{0}' is not connected")]
    NotConnected(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport closed while a request was in flight.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Server process failed.
    #[error("Server process error: {0}")]
    ProcessError(String),

    /// The server wrote more unread output than allowed.
    #[error("Server output exceeded the {limit} byte limit; process terminated")]
    OutputLimitExceeded { limit: usize },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The server answered with a JSON-RPC error object.
    #[error("Server error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    ToolError(String),

    /// The transport does not implement the requested capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token storage error.
    #[error("Token storage error: {0}")]
    Storage(#[from] tether_auth::AuthError),

    /// Operation timed out.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Server initialization failed.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// No usable token exists for an OAuth-protected server.
    #[error(
        "Authentication required for server '{server}'. Run `tether auth {server}` to sign in, then start the server again"
    )]
    AuthRequired { server: String },

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a tool error.
    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::ToolError(message.into())
    }

    /// Create a transport closed error.
    pub fn transport_closed(message: impl Into<String>) -> Self {
        Self::TransportClosed(message.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the server can no longer be talked to.
    ///
    /// These errors demote the server to `error` status.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::NotConnected(_)
                | Self::TransportClosed(_)
                | Self::OutputLimitExceeded { .. }
                | Self::ConnectionFailed(_)
        )
    }

    /// JSON-RPC error code, if this is a server-reported error.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Rebuild an equivalent error for a second receiver.
    ///
    /// Used when one failure has to be delivered to several waiters; variants
    /// wrapping non-cloneable sources degrade to their message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Disabled => Self::Disabled,
            Self::AlreadyRegistered(s) => Self::AlreadyRegistered(s.clone()),
            Self::InvalidConfig { server, message } => Self::InvalidConfig {
                server: server.clone(),
                message: message.clone(),
            },
            Self::ServerNotFound(s) => Self::ServerNotFound(s.clone()),
            Self::NotConnected(s) => Self::NotConnected(s.clone()),
            Self::ConnectionFailed(s) => Self::ConnectionFailed(s.clone()),
            Self::TransportClosed(s) => Self::TransportClosed(s.clone()),
            Self::ProcessError(s) => Self::ProcessError(s.clone()),
            Self::OutputLimitExceeded { limit } => Self::OutputLimitExceeded { limit: *limit },
            Self::ProtocolError(s) => Self::ProtocolError(s.clone()),
            Self::Rpc {
                code,
                message,
                data,
            } => Self::Rpc {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::ToolError(s) => Self::ToolError(s.clone()),
            Self::Unsupported(s) => Self::Unsupported(s.clone()),
            Self::Timeout(d) => Self::Timeout(*d),
            Self::InitializationFailed(s) => Self::InitializationFailed(s.clone()),
            Self::AuthRequired { server } => Self::AuthRequired {
                server: server.clone(),
            },
            Self::AuthFailed(s) => Self::AuthFailed(s.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Json(e) => Self::ProtocolError(e.to_string()),
            Self::Http(e) => Self::ConnectionFailed(e.to_string()),
            Self::Storage(e) => Self::AuthFailed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (McpError::Disabled, "MCP integration is disabled"),
            (
                McpError::AlreadyRegistered("fs".to_string()),
                "Server already registered: fs",
            ),
            (
                McpError::ServerNotFound("test".to_string()),
                "Server not found: test",
            ),
            (
                McpError::NotConnected("fs".to_string()),
                "Server 'fs' is not connected",
            ),
            (
                McpError::ConnectionFailed("refused".to_string()),
                "Connection failed: refused",
            ),
            (
                McpError::OutputLimitExceeded { limit: 1024 },
                "Server output exceeded the 1024 byte limit; process terminated",
            ),
            (
                McpError::Rpc {
                    code: -32601,
                    message: "Method not found".to_string(),
                    data: None,
                },
                "Server error -32601: Method not found",
            ),
            (
                McpError::Timeout(Duration::from_secs(2)),
                "Timed out after 2s",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_auth_required_is_actionable() {
        let err = McpError::AuthRequired {
            server: "github".to_string(),
        };
        assert!(err.to_string().contains("tether auth github"));
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(McpError::Timeout(Duration::from_secs(1)).is_connection_loss());
        assert!(McpError::transport_closed("exit").is_connection_loss());
        assert!(McpError::NotConnected("x".into()).is_connection_loss());
        assert!(!McpError::protocol_error("bad").is_connection_loss());
        assert!(!McpError::Rpc {
            code: -1,
            message: "x".into(),
            data: None
        }
        .is_connection_loss());
    }

    #[test]
    fn test_duplicate_preserves_message() {
        let err = McpError::OutputLimitExceeded { limit: 10 };
        assert_eq!(err.duplicate().to_string(), err.to_string());

        let io = McpError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed",
        ));
        assert!(io.duplicate().to_string().contains("pipe closed"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(mcp_err.to_string().contains("JSON error"));
    }
}
