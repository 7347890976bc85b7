//! SSE (Server-Sent Events) transport for remote MCP servers.
//!
//! Requests go out as HTTP POSTs to the message endpoint; responses and
//! notifications arrive on a long-lived event stream and are correlated by id.

use super::{dispatch_message, PendingRequests, ProgressSink, Transport};
use crate::config::TransportKind;
use crate::error::{McpError, McpResult};
use crate::log::ServerLog;
use crate::protocol::{with_progress_token, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// How long `connect` waits for an `endpoint` event before guessing.
const ENDPOINT_WAIT: Duration = Duration::from_secs(2);

/// One parsed Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the stream omits it.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Default ceiling on a single buffered event (10 MB).
pub const DEFAULT_MAX_EVENT: usize = 10 * 1024 * 1024;

/// Incremental parser for a `text/event-stream` body.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Offset where the next search for a blank line resumes.
    scanned: usize,
    max_event: usize,
    /// Dropping the rest of an oversized event.
    discarding: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_event(DEFAULT_MAX_EVENT)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_event(max_event: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_event: max_event.max(2),
            discarding: false,
        }
    }

    /// Feed raw bytes, returning every event completed by them.
    ///
    /// An event larger than the limit is dropped up to its terminating blank
    /// line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        let mut start = 0;
        let mut search = self.scanned;
        while let Some(pos) = self.buffer[search..].windows(2).position(|w| w == b"\n\n") {
            let end = search + pos + 2;
            if self.discarding {
                self.discarding = false;
            } else if let Some(event) =
                Self::parse_block(&String::from_utf8_lossy(&self.buffer[start..end]))
            {
                events.push(event);
            }
            start = end;
            search = end;
        }
        self.buffer.drain(..start);
        // The last byte may pair with the first byte of the next chunk.
        self.scanned = self.buffer.len().saturating_sub(1);

        if self.buffer.len() > self.max_event {
            if !self.discarding {
                warn!(limit = self.max_event, "Dropping oversized SSE event");
            }
            let trailing_newline = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if trailing_newline {
                self.buffer.push(b'\n');
            }
            self.scanned = 0;
            self.discarding = true;
        }
        events
    }

    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        let mut id = None;

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if data.is_empty() && event.is_none() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
            id,
        })
    }
}

/// SSE transport for remote MCP servers.
pub struct SseTransport {
    server: String,
    url: Url,
    headers: HashMap<String, String>,
    auth_token: Option<String>,
    client: Client,
    log: ServerLog,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    endpoint: Arc<RwLock<Option<Url>>>,
    cancel: RwLock<Option<CancellationToken>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Create a new SSE transport.
    pub fn new(
        server: impl Into<String>,
        url: &str,
        headers: HashMap<String, String>,
        auth_token: Option<String>,
        log: ServerLog,
    ) -> McpResult<Self> {
        let server = server.into();
        let url = Url::parse(url).map_err(|e| McpError::invalid_config(&server, e.to_string()))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            server,
            url,
            headers,
            auth_token,
            client,
            log,
            pending: Arc::new(PendingRequests::new()),
            connected: Arc::new(AtomicBool::new(false)),
            endpoint: Arc::new(RwLock::new(None)),
            cancel: RwLock::new(None),
            reader: std::sync::Mutex::new(None),
        })
    }

    /// URL requests are currently posted to.
    pub async fn message_endpoint(&self) -> Option<Url> {
        self.endpoint.read().await.clone()
    }

    fn with_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        req
    }

    fn sibling_endpoint(&self) -> McpResult<Url> {
        self.url
            .join("message")
            .map_err(|e| McpError::connection_failed(format!("Invalid message endpoint: {e}")))
    }

    /// POST a JSON body to the message endpoint.
    ///
    /// A JSON-RPC body in the POST response is dispatched like a stream event.
    async fn post(&self, body: String) -> McpResult<()> {
        let endpoint = match self.endpoint.read().await.clone() {
            Some(endpoint) => endpoint,
            None => self.sibling_endpoint()?,
        };

        let response = self
            .with_headers(self.client.post(endpoint))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    McpError::connection_failed(format!("Connection failed: {e}"))
                } else {
                    McpError::protocol_error(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired {
                server: self.server.clone(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        let is_json = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        if is_json {
            let text = response.text().await.unwrap_or_default();
            if let Some(reply) = dispatch_message(&self.server, &text, &self.pending) {
                debug!(server = %self.server, id = reply.id, "Ignoring server request in POST body");
            }
        }
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        sink: Option<ProgressSink>,
    ) -> McpResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(McpError::NotConnected(self.server.clone()));
        }

        let streaming = sink.is_some();
        let (id, rx) = self.pending.register(sink)?;
        let params = if streaming {
            Some(with_progress_token(params, id))
        } else {
            params
        };

        let body = match serde_json::to_string(&JsonRpcRequest::new(id, method, params)) {
            Ok(body) => body,
            Err(e) => {
                self.pending.remove(id);
                return Err(e.into());
            }
        };

        debug!(server = %self.server, id, method = %method, "Sending SSE request");
        match tokio::time::timeout(timeout, self.post(body)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(id);
                return Err(e);
            }
            Err(_) => {
                self.pending.remove(id);
                return Err(McpError::Timeout(timeout));
            }
        }
        self.pending.wait(id, rx, timeout).await
    }
}

/// State the stream reader task needs.
struct StreamReader {
    server: String,
    base: Url,
    client: Client,
    headers: HashMap<String, String>,
    auth_token: Option<String>,
    log: ServerLog,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    endpoint: Arc<RwLock<Option<Url>>>,
    endpoint_tx: watch::Sender<bool>,
}

impl StreamReader {
    async fn run(self, response: reqwest::Response, cancel: CancellationToken) {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        let reason = loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for event in parser.feed(&bytes) {
                        self.handle(event).await;
                    }
                }
                Some(Err(e)) => break format!("event stream failed: {e}"),
                None => break "event stream ended".to_string(),
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        info!(server = %self.server, reason = %reason, "SSE stream closed");
        self.log.event(reason.clone());
        self.pending.reject_all(McpError::transport_closed(reason));
    }

    async fn handle(&self, event: SseEvent) {
        match event.event.as_str() {
            "endpoint" => match self.base.join(event.data.trim()) {
                Ok(url) => {
                    debug!(server = %self.server, endpoint = %url, "Received message endpoint");
                    *self.endpoint.write().await = Some(url);
                    let _ = self.endpoint_tx.send(true);
                }
                Err(e) => warn!(server = %self.server, error = %e, "Invalid endpoint event"),
            },
            "message" => {
                if let Some(reply) = dispatch_message(&self.server, &event.data, &self.pending) {
                    self.reply(reply).await;
                }
            }
            other => debug!(server = %self.server, event = %other, "Ignoring SSE event"),
        }
    }

    async fn reply(&self, reply: JsonRpcResponse) {
        let endpoint = match self.endpoint.read().await.clone() {
            Some(endpoint) => endpoint,
            None => match self.base.join("message") {
                Ok(endpoint) => endpoint,
                Err(_) => return,
            },
        };
        let mut req = self.client.post(endpoint).json(&reply);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Err(e) = req.send().await {
            warn!(server = %self.server, error = %e, "Failed to reply to server request");
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> McpResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        debug!(server = %self.server, url = %self.url, "Opening SSE stream");
        let response = self
            .with_headers(self.client.get(self.url.clone()))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::connection_failed(format!("Failed to open event stream: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired {
                server: self.server.clone(),
            });
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "Event stream returned {status}"
            )));
        }

        self.pending.reopen();
        *self.endpoint.write().await = None;
        self.connected.store(true, Ordering::SeqCst);

        let (endpoint_tx, mut endpoint_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let reader = StreamReader {
            server: self.server.clone(),
            base: self.url.clone(),
            client: self.client.clone(),
            headers: self.headers.clone(),
            auth_token: self.auth_token.clone(),
            log: self.log.clone(),
            pending: self.pending.clone(),
            connected: self.connected.clone(),
            endpoint: self.endpoint.clone(),
            endpoint_tx,
        };
        let task = tokio::spawn(reader.run(response, cancel.clone()));
        *self.cancel.write().await = Some(cancel);
        if let Some(old) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }

        let announced = matches!(
            tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx.wait_for(|seen| *seen)).await,
            Ok(Ok(_))
        );
        if !announced {
            if !self.is_connected() {
                return Err(McpError::connection_failed(
                    "Event stream closed during connect",
                ));
            }
            let fallback = self.sibling_endpoint()?;
            debug!(server = %self.server, endpoint = %fallback, "No endpoint event, using sibling endpoint");
            *self.endpoint.write().await = Some(fallback);
        }

        self.log.event(format!("event stream open at {}", self.url));
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.write().await.take() {
            cancel.cancel();
        }
        let task = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            self.log.event("event stream closed");
        }
        self.pending
            .reject_all(McpError::transport_closed("transport disconnected"));
        debug!(server = %self.server, "Closed SSE transport");
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<JsonRpcResponse> {
        self.send_request(method, params, timeout, None).await
    }

    async fn request_streaming(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        sink: ProgressSink,
    ) -> McpResult<JsonRpcResponse> {
        self.send_request(method, params, timeout, Some(sink)).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::NotConnected(self.server.clone()));
        }
        debug!(server = %self.server, method = %method, "Sending SSE notification");
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.post(body).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
