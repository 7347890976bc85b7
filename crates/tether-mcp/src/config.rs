//! Server and client configuration.

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Static regex for `${NAME}` placeholders, compiled once.
static VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn var_regex() -> &'static regex::Regex {
    VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Replace every `${NAME}` in `value` using `lookup`.
///
/// Unknown variables become empty strings and are logged.
pub fn substitute_env_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    var_regex()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            lookup(name).unwrap_or_else(|| {
                warn!(variable = %name, "Environment variable not set, substituting empty string");
                String::new()
            })
        })
        .into_owned()
}

/// Replace every `${NAME}` in `value` with the process environment's `NAME`.
pub fn substitute_env(value: &str) -> String {
    substitute_env_with(value, |name| std::env::var(name).ok())
}

/// Transport used to reach a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local subprocess speaking newline-delimited JSON over stdin/stdout.
    #[default]
    Stdio,
    /// Server-Sent Events stream plus POST endpoint.
    Sse,
    /// One POST per request.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// OAuth settings for a remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    /// Authorization endpoint.
    pub authorization_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Revocation endpoint, if the provider has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_url: Option<String>,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Local port for the redirect listener. 0 picks a free port.
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_true")]
    pub use_pkce: bool,
}

fn default_redirect_port() -> u16 {
    19876
}

fn default_true() -> bool {
    true
}

impl OAuthConfig {
    /// Create a PKCE-enabled config with the default redirect port.
    pub fn new(
        authorization_url: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            authorization_url: authorization_url.into(),
            token_url: token_url.into(),
            revocation_url: None,
            client_id: client_id.into(),
            client_secret: None,
            scopes: Vec::new(),
            redirect_port: default_redirect_port(),
            use_pkce: true,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_revocation_url(mut self, url: impl Into<String>) -> Self {
        self.revocation_url = Some(url.into());
        self
    }

    pub fn with_redirect_port(mut self, port: u16) -> Self {
        self.redirect_port = port;
        self
    }

    /// Redirect URI for a listener bound to `port`.
    pub fn redirect_uri(port: u16) -> String {
        format!("http://127.0.0.1:{port}/callback")
    }
}

/// Configuration for one server.
///
/// Immutable once registered; changing it requires stop + start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Executable for the stdio transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment overlaid on the inherited one. Values may contain `${NAME}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub transport: TransportKind,

    /// Endpoint for the sse and http transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Static headers for the sse and http transports.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Connect and request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,

    /// Whether the server should be started by `start_all`-style callers.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::empty(TransportKind::Stdio)
        }
    }

    /// Create an SSE server configuration.
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::empty(TransportKind::Sse)
        }
    }

    /// Create an HTTP server configuration.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::empty(TransportKind::Http)
        }
    }

    fn empty(transport: TransportKind) -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            transport,
            url: None,
            headers: HashMap::new(),
            timeout: None,
            oauth: None,
            enabled: true,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_oauth(mut self, oauth: OAuthConfig) -> Self {
        self.oauth = Some(oauth);
        self
    }

    /// Per-server timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    /// Environment with placeholders resolved against the process environment.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), substitute_env(v)))
            .collect()
    }

    /// Check that the transport-specific fields are present.
    pub fn validate(&self, name: &str) -> McpResult<()> {
        match self.transport {
            TransportKind::Stdio => match &self.command {
                Some(command) if !command.trim().is_empty() => Ok(()),
                _ => Err(McpError::invalid_config(
                    name,
                    "stdio transport requires a command",
                )),
            },
            TransportKind::Sse | TransportKind::Http => {
                let Some(url) = &self.url else {
                    return Err(McpError::invalid_config(
                        name,
                        format!("{} transport requires a url", self.transport),
                    ));
                };
                let parsed = url::Url::parse(url)
                    .map_err(|e| McpError::invalid_config(name, format!("invalid url: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::invalid_config(
                        name,
                        format!("unsupported url scheme '{}'", parsed.scheme()),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Client-wide settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Global switch; when false every `start_server` fails.
    pub enabled: bool,
    /// Default connect timeout.
    pub connect_timeout: Duration,
    /// Default timeout for list/read/get requests.
    pub request_timeout: Duration,
    /// Default timeout for tool calls.
    pub tool_timeout: Duration,
    /// Timeout for the `initialize` probe after connecting.
    pub initialize_timeout: Duration,
    /// Pause between stop and start in `restart_server`.
    pub restart_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(60),
            initialize_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_millis(500),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    /// Initial restart backoff in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_backoff_ms: u64,
    /// Consecutive successful polls required to leave `health-check`.
    pub health_check_successes: u32,
    /// Consecutive failed polls that demote a connected server.
    pub failure_threshold: u32,
    /// Number of polls run at the fast interval after start.
    pub fast_checks: u32,
    pub fast_interval_ms: u64,
    pub slow_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_restart_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            health_check_successes: 3,
            failure_threshold: 3,
            fast_checks: 5,
            fast_interval_ms: 1_000,
            slow_interval_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Poll interval after `checks_done` scheduled checks.
    pub fn interval_after(&self, checks_done: u32) -> Duration {
        if checks_done < self.fast_checks {
            Duration::from_millis(self.fast_interval_ms)
        } else {
            Duration::from_millis(self.slow_interval_ms)
        }
    }
}

/// On-disk configuration file.
///
/// ```json
/// {
///   "enabled": true,
///   "mcpServers": {
///     "fs": { "command": "mcp-fs", "args": ["/tmp"], "env": { "TOKEN": "${FS_TOKEN}" } },
///     "search": { "transport": "sse", "url": "https://search.example.com/sse" }
///   },
///   "health": { "maxRestartAttempts": 5 }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfigFile {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mcp_servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub health: HealthConfig,
}

impl McpConfigFile {
    /// Parse a configuration from JSON text.
    pub fn parse(content: &str) -> McpResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a configuration file.
    pub async fn load(path: &Path) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Client settings implied by this file.
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            enabled: self.enabled,
            ..ClientSettings::default()
        }
    }

    /// Enabled servers, sorted by name.
    pub fn enabled_servers(&self) -> Vec<(String, ServerConfig)> {
        let mut servers: Vec<_> = self
            .mcp_servers
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        servers
    }
}
