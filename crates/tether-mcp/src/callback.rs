//! Local redirect listener for the OAuth authorization-code flow.
//!
//! The listener binds `127.0.0.1:<port>`, answers `GET /callback` with a small
//! HTML page, hands the first code or error to the waiting flow and then shuts
//! itself down. Anything else gets a 404 and the listener keeps waiting.

use crate::error::{McpError, McpResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Path the provider redirects to.
pub const CALLBACK_PATH: &str = "/callback";

/// How long a single browser connection may take to send its request line.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>tether - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #1a1a2e; color: #eee; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #4ade80; margin-bottom: 1rem; }
    p { color: #aaa; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Successful</h1>
    <p>You can close this window and return to your terminal.</p>
  </div>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>tether - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #1a1a2e; color: #eee; }}
    .container {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #f87171; margin-bottom: 1rem; }}
    .error {{ color: #fca5a5; font-family: monospace; margin-top: 1rem; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Failed</h1>
    <div class="error">{}</div>
  </div>
</body>
</html>"#,
        html_escape(error)
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// What the provider redirected back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code {
        code: String,
        state: Option<String>,
    },
    Denied {
        error: String,
        description: Option<String>,
    },
}

impl CallbackOutcome {
    fn from_query(params: &HashMap<String, String>) -> Option<Self> {
        if let Some(error) = params.get("error") {
            return Some(Self::Denied {
                error: error.clone(),
                description: params.get("error_description").cloned(),
            });
        }
        params.get("code").map(|code| Self::Code {
            code: code.clone(),
            state: params.get("state").cloned(),
        })
    }
}

/// Single-use HTTP listener for the OAuth redirect.
pub struct OAuthCallbackServer {
    addr: SocketAddr,
    outcome: Mutex<Option<oneshot::Receiver<CallbackOutcome>>>,
    shutdown: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OAuthCallbackServer {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(port: u16) -> McpResult<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .map_err(|e| {
                McpError::AuthFailed(format!(
                    "Failed to bind OAuth callback listener on port {port}: {e}"
                ))
            })?;
        let addr = listener.local_addr()?;
        info!(port = addr.port(), "OAuth callback listener started");

        let (tx, rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, tx, shutdown.clone()));

        Ok(Self {
            addr,
            outcome: Mutex::new(Some(rx)),
            shutdown,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `http://127.0.0.1:<port>/callback`
    pub fn redirect_uri(&self) -> String {
        crate::config::OAuthConfig::redirect_uri(self.port())
    }

    /// Whether the listener still holds its port.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Wait for the redirect and return the authorization code.
    ///
    /// When `expected_state` is set the callback must carry the same value.
    pub async fn wait_for_code(
        &self,
        expected_state: Option<&str>,
        timeout: Duration,
    ) -> McpResult<String> {
        let rx = self
            .outcome
            .lock()
            .await
            .take()
            .ok_or_else(|| McpError::AuthFailed("Callback already consumed".to_string()))?;

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(McpError::AuthFailed(
                    "Callback listener stopped before authorization completed".to_string(),
                ))
            }
            Err(_) => {
                return Err(McpError::AuthFailed(format!(
                    "Timed out after {timeout:?} waiting for authorization"
                )))
            }
        };

        match outcome {
            CallbackOutcome::Code { code, state } => {
                if let Some(expected) = expected_state {
                    if state.as_deref() != Some(expected) {
                        warn!("OAuth callback state mismatch");
                        return Err(McpError::AuthFailed(
                            "Callback state did not match the authorization request".to_string(),
                        ));
                    }
                }
                Ok(code)
            }
            CallbackOutcome::Denied { error, description } => {
                let detail = description.map(|d| format!(": {d}")).unwrap_or_default();
                Err(McpError::AuthFailed(format!(
                    "Authorization denied ({error}){detail}"
                )))
            }
        }
    }

    /// Shut the listener down and wait until the port is released.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
            debug!(port = self.port(), "OAuth callback listener stopped");
        }
    }
}

impl Drop for OAuthCallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: oneshot::Sender<CallbackOutcome>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Error accepting OAuth callback connection");
                    continue;
                }
            },
        };

        match handle_connection(stream).await {
            Ok(Some(outcome)) => {
                let _ = tx.send(outcome);
                break;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Error handling OAuth callback"),
        }
    }
    // The listener drops here, releasing the port.
}

/// Serve one request. Returns the outcome if this was the redirect.
async fn handle_connection(mut stream: TcpStream) -> std::io::Result<Option<CallbackOutcome>> {
    let mut buffer = [0u8; 4096];
    let n = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(read) => read?,
        Err(_) => return Ok(None),
    };
    let request = String::from_utf8_lossy(&buffer[..n]);
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");

    let Ok(parsed) = url::Url::parse(&format!("http://127.0.0.1{target}")) else {
        respond(&mut stream, 400, "text/plain", "Bad Request").await?;
        return Ok(None);
    };
    if parsed.path() != CALLBACK_PATH {
        respond(&mut stream, 404, "text/plain", "Not Found").await?;
        return Ok(None);
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let outcome = CallbackOutcome::from_query(&params);
    debug!(
        has_code = matches!(outcome, Some(CallbackOutcome::Code { .. })),
        has_error = matches!(outcome, Some(CallbackOutcome::Denied { .. })),
        "Received OAuth callback"
    );
    match &outcome {
        Some(CallbackOutcome::Code { .. }) => {
            respond(&mut stream, 200, "text/html", HTML_SUCCESS).await?;
        }
        Some(CallbackOutcome::Denied { error, description }) => {
            let message = description.as_deref().unwrap_or(error);
            respond(&mut stream, 200, "text/html", &html_error(message)).await?;
        }
        None => {
            let html = html_error("No authorization code provided");
            respond(&mut stream, 400, "text/html", &html).await?;
        }
    }
    Ok(outcome)
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    };
    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: {content_type}; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(port: u16, path_and_query: &str) -> reqwest::Response {
        reqwest::get(format!("http://127.0.0.1:{port}{path_and_query}"))
            .await
            .unwrap()
    }

    async fn port_is_free(port: u16) -> bool {
        TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .is_ok()
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("a & b"), "a &amp; b");
        assert_eq!(html_escape("it's"), "it&#39;s");
    }

    #[test]
    fn test_html_error_escapes() {
        let html = html_error("<script>alert('xss')</script>");
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn test_outcome_from_query() {
        let mut params = HashMap::new();
        assert_eq!(CallbackOutcome::from_query(&params), None);

        params.insert("code".to_string(), "ABC".to_string());
        assert_eq!(
            CallbackOutcome::from_query(&params),
            Some(CallbackOutcome::Code {
                code: "ABC".to_string(),
                state: None
            })
        );

        params.insert("error".to_string(), "access_denied".to_string());
        assert!(matches!(
            CallbackOutcome::from_query(&params),
            Some(CallbackOutcome::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn test_code_callback_releases_port() {
        let server = OAuthCallbackServer::bind(0).await.unwrap();
        let port = server.port();
        assert!(server.is_running());
        assert!(!port_is_free(port).await);

        let response = get(port, "/callback?code=ABC").await;
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("Authorization Successful"));

        let code = server
            .wait_for_code(None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, "ABC");

        server.stop().await;
        assert!(!server.is_running());
        assert!(port_is_free(port).await);
    }

    #[tokio::test]
    async fn test_error_callback_rejects_and_releases_port() {
        let server = OAuthCallbackServer::bind(0).await.unwrap();
        let port = server.port();

        let response = get(port, "/callback?error=access_denied").await;
        assert_eq!(response.status(), 200);

        let err = server
            .wait_for_code(None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("access_denied"));

        server.stop().await;
        assert!(port_is_free(port).await);
    }

    #[tokio::test]
    async fn test_other_paths_do_not_complete() {
        let server = OAuthCallbackServer::bind(0).await.unwrap();
        let port = server.port();

        assert_eq!(get(port, "/favicon.ico").await.status(), 404);
        assert_eq!(get(port, "/callback").await.status(), 400);
        assert!(server.is_running());

        get(port, "/callback?code=XYZ&state=s1").await;
        assert_eq!(
            server
                .wait_for_code(Some("s1"), Duration::from_secs(5))
                .await
                .unwrap(),
            "XYZ"
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_state_mismatch() {
        let server = OAuthCallbackServer::bind(0).await.unwrap();
        get(server.port(), "/callback?code=XYZ&state=forged").await;
        let err = server
            .wait_for_code(Some("expected"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::AuthFailed(_)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_then_stop_releases_port() {
        let server = OAuthCallbackServer::bind(0).await.unwrap();
        let port = server.port();
        let err = server
            .wait_for_code(None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Timed out"));

        server.stop().await;
        server.stop().await;
        assert!(port_is_free(port).await);
    }
}
