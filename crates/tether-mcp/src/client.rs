//! MCP client: the registry of named servers.

use crate::config::{ClientSettings, ServerConfig, TransportKind};
use crate::error::{McpError, McpResult};
use crate::log::{LogEntry, ServerLog};
use crate::oauth::OAuthProvider;
use crate::protocol::{
    CallToolParams, GetPromptParams, GetPromptResult, InitializeParams, InitializeResult,
    JsonRpcResponse, ListPromptsResult, ListResourcesResult, ListToolsResult, McpPrompt,
    McpResource, McpTool, PaginatedParams, ProgressParams, ReadResourceParams, ReadResourceResult,
    ServerInfo, ToolCallResult, METHOD_NOT_FOUND,
};
use crate::transport::{
    DefaultTransportFactory, ProgressSink, Transport, TransportContext, TransportFactory,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Coarse status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of one server's state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusInfo {
    pub name: String,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<Duration>,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

impl ServerStatusInfo {
    fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServerStatus::Disconnected,
            error: None,
            transport: None,
            uptime: None,
            tool_count: 0,
            server_info: None,
        }
    }
}

/// One piece of a streaming tool call.
///
/// Exactly one terminal chunk (`Done` or `Failed`) is delivered, and nothing
/// after it.
#[derive(Debug, Clone)]
pub enum ToolChunk {
    Progress(ProgressParams),
    Done(ToolCallResult),
    Failed(String),
}

impl ToolChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Forwards chunks to the caller until the terminal one.
struct ChunkGate {
    on_chunk: Box<dyn Fn(ToolChunk) + Send + Sync>,
    finished: AtomicBool,
}

impl ChunkGate {
    fn emit(&self, chunk: ToolChunk) {
        if !self.finished.load(Ordering::SeqCst) {
            (self.on_chunk)(chunk);
        }
    }

    fn finish(&self, chunk: ToolChunk) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            (self.on_chunk)(chunk);
        }
    }
}

/// Registry entry for one server.
struct ServerEntry {
    config: ServerConfig,
    status: ServerStatus,
    error: Option<String>,
    transport: Arc<dyn Transport>,
    log: ServerLog,
    started_at: Option<Instant>,
    init: Option<InitializeResult>,
    tools: Vec<McpTool>,
    resources: Vec<McpResource>,
    prompts: Vec<McpPrompt>,
    /// Distinguishes this registration from later ones under the same name.
    generation: u64,
}

impl ServerEntry {
    fn effective_status(&self) -> ServerStatus {
        if self.status == ServerStatus::Connected && !self.transport.is_connected() {
            ServerStatus::Disconnected
        } else {
            self.status
        }
    }

    fn info(&self, name: &str) -> ServerStatusInfo {
        ServerStatusInfo {
            name: name.to_string(),
            status: self.effective_status(),
            error: self.error.clone(),
            transport: Some(self.transport.kind()),
            uptime: self.started_at.map(|t| t.elapsed()),
            tool_count: self.tools.len(),
            server_info: self.init.as_ref().map(|i| i.server_info.clone()),
        }
    }
}

/// Cached list to refresh after a list call.
enum Cached {
    Tools(Vec<McpTool>),
    Resources(Vec<McpResource>),
    Prompts(Vec<McpPrompt>),
}

/// MCP client for managing multiple server connections.
pub struct McpClient {
    settings: ClientSettings,
    servers: RwLock<HashMap<String, ServerEntry>>,
    oauth: Option<Arc<OAuthProvider>>,
    factory: Arc<dyn TransportFactory>,
    generation: AtomicU64,
}

impl McpClient {
    /// Create a new MCP client.
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            servers: RwLock::new(HashMap::new()),
            oauth: None,
            factory: Arc::new(DefaultTransportFactory),
            generation: AtomicU64::new(1),
        }
    }

    /// Use `provider` for servers that declare OAuth.
    pub fn with_oauth(mut self, provider: Arc<OAuthProvider>) -> Self {
        self.oauth = Some(provider);
        self
    }

    /// Replace the transport factory.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Register and connect a server.
    ///
    /// On failure the entry stays registered in the `error` state so its
    /// status and logs can still be inspected.
    pub async fn start_server(&self, name: &str, config: ServerConfig) -> McpResult<()> {
        if !self.settings.enabled {
            return Err(McpError::Disabled);
        }
        config.validate(name)?;
        if self.servers.read().await.contains_key(name) {
            return Err(McpError::AlreadyRegistered(name.to_string()));
        }

        let access_token = match &config.oauth {
            Some(oauth) => {
                let provider = self.oauth.as_ref().ok_or_else(|| McpError::AuthRequired {
                    server: name.to_string(),
                })?;
                let token = provider.get_access_token(name, oauth).await?;
                Some(token.ok_or_else(|| McpError::AuthRequired {
                    server: name.to_string(),
                })?)
            }
            None => None,
        };

        let log = ServerLog::default();
        let transport = self.factory.create(
            &config,
            TransportContext {
                server: name.to_string(),
                log: log.clone(),
                access_token,
                env: config.resolved_env(),
            },
        )?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut servers = self.servers.write().await;
            if servers.contains_key(name) {
                return Err(McpError::AlreadyRegistered(name.to_string()));
            }
            log.event(format!("starting ({} transport)", config.transport));
            servers.insert(
                name.to_string(),
                ServerEntry {
                    config: config.clone(),
                    status: ServerStatus::Starting,
                    error: None,
                    transport: transport.clone(),
                    log: log.clone(),
                    started_at: None,
                    init: None,
                    tools: Vec::new(),
                    resources: Vec::new(),
                    prompts: Vec::new(),
                    generation,
                },
            );
        }

        info!(server = %name, transport = %config.transport, "Starting MCP server");
        // Connect and initialize share one budget.
        let connect_timeout = config.timeout().unwrap_or(self.settings.connect_timeout);
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let outcome = match tokio::time::timeout_at(deadline, transport.connect()).await {
            Ok(Ok(())) => self.initialize(name, &transport, deadline).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::Timeout(connect_timeout)),
        };

        match outcome {
            Ok(init) => {
                let mut servers = self.servers.write().await;
                match servers.get_mut(name) {
                    Some(entry) if entry.generation == generation => {
                        entry.status = ServerStatus::Connected;
                        entry.error = None;
                        entry.started_at = Some(Instant::now());
                        entry.init = init;
                        log.event("connected");
                        info!(server = %name, "MCP server connected");
                        Ok(())
                    }
                    _ => {
                        drop(servers);
                        let _ = transport.disconnect().await;
                        Err(McpError::connection_failed(format!(
                            "Server '{name}' was stopped while starting"
                        )))
                    }
                }
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Failed to start MCP server");
                log.event(format!("start failed: {e}"));
                if let Err(err) = transport.disconnect().await {
                    debug!(server = %name, error = %err, "Cleanup after failed start");
                }
                let mut servers = self.servers.write().await;
                if let Some(entry) = servers.get_mut(name) {
                    if entry.generation == generation {
                        entry.status = ServerStatus::Error;
                        entry.error = Some(e.to_string());
                    }
                }
                Err(e)
            }
        }
    }

    /// Send `initialize` and the `initialized` notification.
    ///
    /// Servers that reject or ignore `initialize` are still accepted; only a
    /// transport that dies during the probe fails the start. Nothing here
    /// runs past `deadline`.
    async fn initialize(
        &self,
        name: &str,
        transport: &Arc<dyn Transport>,
        deadline: tokio::time::Instant,
    ) -> McpResult<Option<InitializeResult>> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let timeout = self.settings.initialize_timeout.min(remaining);

        match transport.request("initialize", Some(params), timeout).await {
            Ok(JsonRpcResponse {
                error: Some(error), ..
            }) => {
                warn!(server = %name, code = error.code, message = %error.message, "Server rejected initialize, continuing");
                Ok(None)
            }
            Ok(response) => {
                let init = response
                    .result
                    .and_then(|r| serde_json::from_value::<InitializeResult>(r).ok());
                if let Some(ref init) = init {
                    debug!(
                        server = %name,
                        protocol_version = %init.protocol_version,
                        server_name = %init.server_info.name,
                        "MCP server initialized"
                    );
                }
                let notified = tokio::time::timeout_at(
                    deadline,
                    transport.notify("notifications/initialized", None),
                )
                .await;
                match notified {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(server = %name, error = %e, "Failed to send initialized notification")
                    }
                    Err(_) => warn!(server = %name, "Timed out sending initialized notification"),
                }
                Ok(init)
            }
            Err(e) if transport.is_connected() => {
                warn!(server = %name, error = %e, "No answer to initialize, assuming it is unsupported");
                Ok(None)
            }
            Err(e) => Err(McpError::InitializationFailed(e.to_string())),
        }
    }

    /// Disconnect and unregister a server. Unknown names are ignored.
    pub async fn stop_server(&self, name: &str) {
        let entry = self.servers.write().await.remove(name);
        let Some(entry) = entry else {
            return;
        };

        if let Err(e) = entry.transport.disconnect().await {
            warn!(server = %name, error = %e, "Error disconnecting server");
        }
        entry.log.event("stopped");
        info!(server = %name, "Stopped MCP server");
    }

    /// Stop every registered server.
    pub async fn stop_all(&self) {
        for name in self.server_names().await {
            self.stop_server(&name).await;
        }
    }

    /// Stop, pause briefly, then start again with the same configuration.
    pub async fn restart_server(&self, name: &str) -> McpResult<()> {
        let config = self
            .server_config(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        self.stop_server(name).await;
        tokio::time::sleep(self.settings.restart_delay).await;
        self.start_server(name, config).await
    }

    /// Transport for a server that is currently `connected`.
    async fn connected_transport(&self, name: &str) -> McpResult<(u64, Arc<dyn Transport>)> {
        let servers = self.servers.read().await;
        let entry = servers
            .get(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        if entry.effective_status() != ServerStatus::Connected {
            return Err(McpError::NotConnected(name.to_string()));
        }
        Ok((entry.generation, entry.transport.clone()))
    }

    fn request_timeout(&self, config: &ServerConfig, default: Duration) -> Duration {
        config.timeout().unwrap_or(default)
    }

    async fn timeout_for(&self, name: &str, default: Duration) -> Duration {
        match self.servers.read().await.get(name) {
            Some(entry) => self.request_timeout(&entry.config, default),
            None => default,
        }
    }

    /// Mark a server failed after a call error.
    async fn demote(&self, name: &str, generation: u64, error: &McpError) {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            if entry.generation == generation && entry.status != ServerStatus::Error {
                warn!(server = %name, error = %error, "Marking server as failed");
                entry.status = ServerStatus::Error;
                entry.error = Some(error.to_string());
                entry.log.event(format!("marked failed: {error}"));
            }
        }
    }

    /// Issue one request to a connected server.
    ///
    /// Connection-loss errors always demote the server; `demote_all` extends
    /// that to every failure.
    async fn call(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        demote_all: bool,
    ) -> McpResult<Value> {
        let (generation, transport) = self.connected_transport(name).await?;
        let result = transport
            .request(method, params, timeout)
            .await
            .and_then(into_result);
        if let Err(ref e) = result {
            let not_found = e.rpc_code() == Some(METHOD_NOT_FOUND);
            if e.is_connection_loss() || (demote_all && !not_found) {
                self.demote(name, generation, e).await;
            }
        }
        result
    }

    /// Call a tool and wait for its result.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> McpResult<ToolCallResult> {
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments: Some(arguments),
        })?;
        let timeout = self.timeout_for(server, self.settings.tool_timeout).await;

        debug!(server = %server, tool = %tool, "Calling MCP tool");
        let value = self
            .call(server, "tools/call", Some(params), timeout, false)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid tools/call result: {e}")))
    }

    /// Call a tool, reporting progress through `on_chunk`.
    ///
    /// Transports without streaming fall back to a single call that delivers
    /// one terminal chunk.
    pub async fn call_tool_streaming<F>(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        on_chunk: F,
    ) -> McpResult<ToolCallResult>
    where
        F: Fn(ToolChunk) + Send + Sync + 'static,
    {
        let gate = Arc::new(ChunkGate {
            on_chunk: Box::new(on_chunk),
            finished: AtomicBool::new(false),
        });

        let result = self
            .stream_tool(server, tool, arguments, gate.clone())
            .await;
        match &result {
            Ok(done) => gate.finish(ToolChunk::Done(done.clone())),
            Err(e) => gate.finish(ToolChunk::Failed(e.to_string())),
        }
        result
    }

    async fn stream_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        gate: Arc<ChunkGate>,
    ) -> McpResult<ToolCallResult> {
        let (generation, transport) = self.connected_transport(server).await?;
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments: Some(arguments),
        })?;
        let timeout = self.timeout_for(server, self.settings.tool_timeout).await;

        let response = if transport.supports_streaming() {
            let sink: ProgressSink =
                Arc::new(move |p: ProgressParams| gate.emit(ToolChunk::Progress(p)));
            match transport
                .request_streaming("tools/call", Some(params.clone()), timeout, sink)
                .await
            {
                Err(McpError::Unsupported(_)) => {
                    transport.request("tools/call", Some(params), timeout).await
                }
                other => other,
            }
        } else {
            debug!(server = %server, tool = %tool, "Transport cannot stream, using a single call");
            transport.request("tools/call", Some(params), timeout).await
        };

        let result = response.and_then(into_result).and_then(|value| {
            serde_json::from_value::<ToolCallResult>(value)
                .map_err(|e| McpError::protocol_error(format!("Invalid tools/call result: {e}")))
        });
        if let Err(ref e) = result {
            if e.is_connection_loss() {
                self.demote(server, generation, e).await;
            }
        }
        result
    }

    /// Follow `nextCursor` until the list is complete.
    async fn list_paginated<R, T, F>(&self, name: &str, method: &str, split: F) -> McpResult<Vec<T>>
    where
        R: serde::de::DeserializeOwned,
        F: Fn(R) -> (Vec<T>, Option<String>),
    {
        let timeout = self.timeout_for(name, self.settings.request_timeout).await;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .clone()
                .map(|cursor| serde_json::to_value(PaginatedParams { cursor: Some(cursor) }))
                .transpose()?;
            let value = match self.call(name, method, params, timeout, true).await {
                Ok(value) => value,
                Err(e) if e.rpc_code() == Some(METHOD_NOT_FOUND) => {
                    debug!(server = %name, method = %method, "Method not supported");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            };
            let page: R = serde_json::from_value(value)
                .map_err(|e| McpError::protocol_error(format!("Invalid {method} result: {e}")))?;
            let (mut page_items, next) = split(page);
            items.append(&mut page_items);

            match next {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn store(&self, name: &str, cached: Cached) {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            match cached {
                Cached::Tools(tools) => entry.tools = tools,
                Cached::Resources(resources) => entry.resources = resources,
                Cached::Prompts(prompts) => entry.prompts = prompts,
            }
        }
    }

    /// List a server's tools and cache them.
    pub async fn get_tools(&self, server: &str) -> McpResult<Vec<McpTool>> {
        let tools = self
            .list_paginated(server, "tools/list", |r: ListToolsResult| {
                (r.tools, r.next_cursor)
            })
            .await?;
        info!(server = %server, tool_count = tools.len(), "Discovered MCP tools");
        self.store(server, Cached::Tools(tools.clone())).await;
        Ok(tools)
    }

    /// List a server's resources and cache them.
    pub async fn get_resources(&self, server: &str) -> McpResult<Vec<McpResource>> {
        let resources = self
            .list_paginated(server, "resources/list", |r: ListResourcesResult| {
                (r.resources, r.next_cursor)
            })
            .await?;
        self.store(server, Cached::Resources(resources.clone())).await;
        Ok(resources)
    }

    /// List a server's prompts and cache them.
    pub async fn get_prompts(&self, server: &str) -> McpResult<Vec<McpPrompt>> {
        let prompts = self
            .list_paginated(server, "prompts/list", |r: ListPromptsResult| {
                (r.prompts, r.next_cursor)
            })
            .await?;
        self.store(server, Cached::Prompts(prompts.clone())).await;
        Ok(prompts)
    }

    /// Read one resource.
    pub async fn read_resource(&self, server: &str, uri: &str) -> McpResult<ReadResourceResult> {
        let params = serde_json::to_value(ReadResourceParams {
            uri: uri.to_string(),
        })?;
        let timeout = self.timeout_for(server, self.settings.request_timeout).await;
        let value = self
            .call(server, "resources/read", Some(params), timeout, true)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid resources/read result: {e}")))
    }

    /// Render one prompt.
    pub async fn get_prompt(
        &self,
        server: &str,
        prompt: &str,
        arguments: Option<Value>,
    ) -> McpResult<GetPromptResult> {
        let params = serde_json::to_value(GetPromptParams {
            name: prompt.to_string(),
            arguments,
        })?;
        let timeout = self.timeout_for(server, self.settings.request_timeout).await;
        let value = self
            .call(server, "prompts/get", Some(params), timeout, true)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid prompts/get result: {e}")))
    }

    /// Status of one server; unknown names report `disconnected`.
    pub async fn get_server_status(&self, name: &str) -> ServerStatusInfo {
        self.servers
            .read()
            .await
            .get(name)
            .map(|entry| entry.info(name))
            .unwrap_or_else(|| ServerStatusInfo::unknown(name))
    }

    /// Status of every registered server, sorted by name.
    pub async fn list_servers(&self) -> Vec<ServerStatusInfo> {
        let servers = self.servers.read().await;
        let mut infos: Vec<_> = servers
            .iter()
            .map(|(name, entry)| entry.info(name))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// The last `n` log lines of a server.
    pub async fn get_server_logs(&self, name: &str, n: usize) -> Vec<LogEntry> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|entry| entry.log.tail(n))
            .unwrap_or_default()
    }

    /// Registered server names, sorted.
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Configuration a server was registered with.
    pub async fn server_config(&self, name: &str) -> Option<ServerConfig> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|entry| entry.config.clone())
    }

    /// Tools from the last successful `get_tools`.
    pub async fn cached_tools(&self, name: &str) -> Vec<McpTool> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|entry| entry.tools.clone())
            .unwrap_or_default()
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(ClientSettings::default())
    }
}

/// Turn a JSON-RPC error object into an `Err`.
fn into_result(response: JsonRpcResponse) -> McpResult<Value> {
    match response.error {
        Some(error) => Err(McpError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

#[async_trait::async_trait]
impl crate::health::ServerRegistry for McpClient {
    async fn server_names(&self) -> Vec<String> {
        McpClient::server_names(self).await
    }

    async fn server_status(&self, name: &str) -> ServerStatus {
        self.get_server_status(name).await.status
    }

    async fn server_config(&self, name: &str) -> Option<ServerConfig> {
        McpClient::server_config(self, name).await
    }

    async fn stop_server(&self, name: &str) {
        McpClient::stop_server(self, name).await
    }

    async fn start_server(&self, name: &str, config: ServerConfig) -> McpResult<()> {
        McpClient::start_server(self, name, config).await
    }
}
