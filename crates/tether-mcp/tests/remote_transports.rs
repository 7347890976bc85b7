//! SSE and HTTP transports against in-process axum servers.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_mcp::{ClientSettings, McpClient, McpError, ServerConfig, ServerStatus, ToolChunk};
use tokio::sync::mpsc;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Replies a small MCP server would send for `request`, in order.
fn answer(request: &Value) -> Vec<Value> {
    let Some(id) = request.get("id").cloned() else {
        return Vec::new();
    };
    match request["method"].as_str().unwrap_or_default() {
        "initialize" => vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "remote", "version": "2.0" }
            }
        })],
        "tools/list" => vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "tools": [{ "name": "search", "inputSchema": { "type": "object" } }] }
        })],
        "tools/call" => {
            let query = request["params"]["arguments"]["query"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let mut replies = Vec::new();
            if let Some(token) = request["params"]["_meta"].get("progressToken") {
                replies.push(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": { "progressToken": token, "progress": 50, "total": 100, "message": "halfway" }
                }));
            }
            replies.push(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{ "type": "text", "text": format!("found {query}") }] }
            }));
            replies
        }
        _ => vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "Method not found" }
        })],
    }
}

/// One-session SSE server: GET /sse streams, POST /message feeds it.
#[derive(Clone, Default)]
struct SseFixture {
    stream: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

async fn sse_stream(
    State(fixture): State<SseFixture>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *fixture.stream.lock().unwrap() = Some(tx);

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("endpoint").data("/message?session=1"));
        while let Some(data) = rx.recv().await {
            yield Ok(Event::default().event("message").data(data));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn sse_message(State(fixture): State<SseFixture>, Json(request): Json<Value>) -> StatusCode {
    if request["method"] == "test/close" {
        // Ends the event stream.
        fixture.stream.lock().unwrap().take();
        return StatusCode::ACCEPTED;
    }
    if let Some(tx) = fixture.stream.lock().unwrap().as_ref() {
        for reply in answer(&request) {
            let _ = tx.send(reply.to_string());
        }
    }
    StatusCode::ACCEPTED
}

async fn sse_server() -> String {
    let app = Router::new()
        .route("/sse", get(sse_stream))
        .route("/message", post(sse_message))
        .with_state(SseFixture::default());
    format!("http://{}/sse", serve(app).await)
}

/// Streamable HTTP server that assigns a session and records the header it gets back.
#[derive(Clone, Default)]
struct HttpFixture {
    sessions: Arc<Mutex<Vec<Option<String>>>>,
}

async fn http_message(
    State(fixture): State<HttpFixture>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> axum::response::Response {
    fixture.sessions.lock().unwrap().push(
        headers
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    );

    let replies = answer(&request);
    let session = [("mcp-session-id", "sess-1")];
    if replies.is_empty() {
        return (StatusCode::ACCEPTED, session).into_response();
    }
    if request["method"] == "tools/call" {
        let body: String = replies
            .iter()
            .map(|reply| format!("event: message\ndata: {reply}\n\n"))
            .collect();
        return (
            session,
            [(header::CONTENT_TYPE, "text/event-stream")],
            body,
        )
            .into_response();
    }
    let last = replies.last().cloned().unwrap_or(Value::Null);
    (session, Json(last)).into_response()
}

async fn http_server() -> (String, HttpFixture) {
    let fixture = HttpFixture::default();
    let app = Router::new()
        .route(
            "/mcp",
            get(|| async { StatusCode::METHOD_NOT_ALLOWED }).post(http_message),
        )
        .with_state(fixture.clone());
    (format!("http://{}/mcp", serve(app).await), fixture)
}

fn client() -> McpClient {
    McpClient::new(ClientSettings {
        connect_timeout: Duration::from_secs(5),
        ..ClientSettings::default()
    })
}

fn collect_chunks() -> (Arc<Mutex<Vec<ToolChunk>>>, impl Fn(ToolChunk) + Send + Sync + 'static) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = chunks.clone();
    (chunks, move |chunk: ToolChunk| sink.lock().unwrap().push(chunk))
}

#[tokio::test]
async fn test_sse_end_to_end() {
    let url = sse_server().await;
    let client = client();
    client
        .start_server("remote", ServerConfig::sse(&url))
        .await
        .unwrap();

    let status = client.get_server_status("remote").await;
    assert_eq!(status.status, ServerStatus::Connected);
    assert_eq!(status.server_info.unwrap().version.as_deref(), Some("2.0"));

    let tools = client.get_tools("remote").await.unwrap();
    assert_eq!(tools[0].name, "search");

    let result = client
        .call_tool("remote", "search", json!({ "query": "rust" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "found rust");

    let (chunks, on_chunk) = collect_chunks();
    let result = client
        .call_tool_streaming("remote", "search", json!({ "query": "tokio" }), on_chunk)
        .await
        .unwrap();
    assert_eq!(result.text(), "found tokio");
    let chunks = chunks.lock().unwrap();
    assert_eq!(chunks.len(), 2);
    match &chunks[0] {
        ToolChunk::Progress(p) => {
            assert_eq!(p.progress, Some(50.0));
            assert_eq!(p.message.as_deref(), Some("halfway"));
        }
        other => panic!("expected progress, got {other:?}"),
    }
    assert!(matches!(chunks[1], ToolChunk::Done(_)));
    drop(chunks);

    client.stop_all().await;
}

#[tokio::test]
async fn test_sse_stream_close_rejects_pending() {
    use tether_mcp::transport::SseTransport;
    use tether_mcp::{ServerLog, Transport};

    let url = sse_server().await;
    let transport =
        SseTransport::new("remote", &url, Default::default(), None, ServerLog::default()).unwrap();
    transport.connect().await.unwrap();
    assert_eq!(
        transport.message_endpoint().await.unwrap().path(),
        "/message"
    );

    let err = transport
        .request("test/close", None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::TransportClosed(_)));
    assert!(!transport.is_connected());

    let err = transport
        .request("tools/list", None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::NotConnected(_)));
}

#[tokio::test]
async fn test_http_end_to_end_with_session() {
    let (url, fixture) = http_server().await;
    let client = client();
    client
        .start_server("remote", ServerConfig::http(&url))
        .await
        .unwrap();

    let tools = client.get_tools("remote").await.unwrap();
    assert_eq!(tools.len(), 1);

    let (chunks, on_chunk) = collect_chunks();
    let result = client
        .call_tool_streaming("remote", "search", json!({ "query": "axum" }), on_chunk)
        .await
        .unwrap();
    assert_eq!(result.text(), "found axum");
    assert!(matches!(
        chunks.lock().unwrap().first(),
        Some(ToolChunk::Progress(_))
    ));

    let sessions = fixture.sessions.lock().unwrap().clone();
    assert_eq!(sessions.first(), Some(&None));
    assert!(sessions[1..]
        .iter()
        .all(|s| s.as_deref() == Some("sess-1")));

    client.stop_all().await;
}

#[tokio::test]
async fn test_http_unauthorized_requires_auth() {
    let app = Router::new().route("/mcp", get(|| async { StatusCode::UNAUTHORIZED }));
    let url = format!("http://{}/mcp", serve(app).await);

    let client = client();
    let err = client
        .start_server("locked", ServerConfig::http(&url))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::AuthRequired { .. }));
    assert_eq!(
        client.get_server_status("locked").await.status,
        ServerStatus::Error
    );
}

#[tokio::test]
async fn test_http_unreachable_fails_to_start() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = client();
    let err = client
        .start_server("gone", ServerConfig::http(format!("http://127.0.0.1:{port}/mcp")))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::ConnectionFailed(_)));
}
