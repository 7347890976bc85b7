//! Plain HTTP transport: one POST per JSON-RPC request.

use super::{ProgressSink, SseParser, Transport};
use crate::config::TransportKind;
use crate::error::{McpError, McpResult};
use crate::log::ServerLog;
use crate::protocol::{
    with_progress_token, IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ProgressParams, METHOD_PROGRESS,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the server-assigned session.
const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP transport for remote MCP servers.
pub struct HttpTransport {
    server: String,
    url: Url,
    headers: HashMap<String, String>,
    auth_token: Option<String>,
    client: Client,
    log: ServerLog,
    next_id: AtomicU64,
    connected: AtomicBool,
    /// Session ID assigned by the server, echoed on every request.
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Create a new HTTP transport.
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
            .timeout(DEFAULT_TIMEOUT * 4)
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
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
        })
    }

    /// Session id the server assigned, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Build request with common headers.
    async fn build_request(&self, body: String) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(ref session) = *self.session_id.read().await {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> McpError {
        if e.is_timeout() {
            McpError::Timeout(timeout)
        } else if e.is_connect() {
            self.connected.store(false, Ordering::SeqCst);
            McpError::connection_failed(format!("Connection failed: {e}"))
        } else {
            McpError::protocol_error(format!("Request failed: {e}"))
        }
    }

    async fn post(&self, body: String, timeout: Duration) -> McpResult<reqwest::Response> {
        let response = self
            .build_request(body)
            .await
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(session) {
                debug!(server = %self.server, session = %session, "Server assigned session");
                *current = Some(session.to_string());
            }
        }

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
        Ok(response)
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

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = if sink.is_some() {
            Some(with_progress_token(params, id))
        } else {
            params
        };
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        debug!(server = %self.server, id, method = %method, "Sending HTTP request");
        let exchange = async {
            let response = self.post(body, timeout).await?;
            self.read_response(id, response, sink).await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(timeout)),
        }
    }

    async fn read_response(
        &self,
        id: u64,
        response: reqwest::Response,
        sink: Option<ProgressSink>,
    ) -> McpResult<JsonRpcResponse> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            return self.read_event_stream(id, response, sink).await;
        }

        let text = response
            .text()
            .await
            .map_err(|e| McpError::protocol_error(format!("Failed to read response: {e}")))?;
        let response: JsonRpcResponse = serde_json::from_str(&text)
            .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))?;
        check_id(id, response)
    }

    /// Read an SSE response body until the response for `id` arrives.
    async fn read_event_stream(
        &self,
        id: u64,
        response: reqwest::Response,
        sink: Option<ProgressSink>,
    ) -> McpResult<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;
            for event in parser.feed(&chunk) {
                if event.event != "message" {
                    continue;
                }
                match IncomingMessage::parse(&event.data) {
                    Ok(IncomingMessage::Response(response)) => return check_id(id, response),
                    Ok(IncomingMessage::Notification(n)) if n.method == METHOD_PROGRESS => {
                        let progress = n
                            .params
                            .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok());
                        if let (Some(sink), Some(progress)) = (&sink, progress) {
                            if progress.request_id() == Some(id) {
                                sink(progress);
                            }
                        }
                    }
                    Ok(other) => {
                        debug!(server = %self.server, message = ?other, "Ignoring message in response stream")
                    }
                    Err(reason) => {
                        warn!(server = %self.server, reason = %reason, "Dropping malformed message")
                    }
                }
            }
        }

        Err(McpError::protocol_error("SSE stream ended without response"))
    }
}

fn check_id(expected: u64, response: JsonRpcResponse) -> McpResult<JsonRpcResponse> {
    if response.id != expected {
        return Err(McpError::protocol_error(format!(
            "Response id {} does not match request id {expected}",
            response.id
        )));
    }
    Ok(response)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> McpResult<()> {
        debug!(server = %self.server, url = %self.url, "Probing HTTP endpoint");
        let mut req = self.client.get(self.url.clone()).timeout(Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpError::connection_failed(format!("Endpoint unreachable: {e}")))?;

        // Any answer proves the endpoint is alive; only a rejected token is fatal.
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired {
                server: self.server.clone(),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        self.log
            .event(format!("endpoint {} answered {}", self.url, response.status()));
        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.log.event("closed");
        }
        *self.session_id.write().await = None;
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
        debug!(server = %self.server, method = %method, "Sending HTTP notification");
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        let response = self.post(body, DEFAULT_TIMEOUT).await?;
        debug!(server = %self.server, status = %response.status(), "Notification accepted");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> HttpTransport {
        HttpTransport::new("remote", url, HashMap::new(), None, ServerLog::default()).unwrap()
    }

    #[test]
    fn test_check_id() {
        assert!(check_id(3, JsonRpcResponse::success(3, Value::Null)).is_ok());
        let err = check_id(3, JsonRpcResponse::success(4, Value::Null)).unwrap_err();
        assert!(matches!(err, McpError::ProtocolError(_)));
    }

    #[test]
    fn test_invalid_url() {
        let result =
            HttpTransport::new("remote", "::nope::", HashMap::new(), None, ServerLog::default());
        assert!(matches!(result, Err(McpError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let transport = transport("http://127.0.0.1:1/mcp");
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionFailed(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_request_requires_connect() {
        let transport = transport("http://127.0.0.1:1/mcp");
        let err = transport
            .request("tools/list", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConnected(_)));
    }
}
