//! Subprocess transport (newline-delimited JSON-RPC over stdio).

use super::{dispatch_message, PendingRequests, ProgressSink, Transport};
use crate::config::TransportKind;
use crate::error::{McpError, McpResult};
use crate::log::ServerLog;
use crate::protocol::{with_progress_token, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, error, info, warn};

/// Default ceiling on a single unread output line (10 MB).
pub const DEFAULT_MAX_OUTPUT: usize = 10 * 1024 * 1024;

/// Longest stderr line kept in the log. The rest of a longer line is dropped.
const MAX_STDERR_LINE: usize = 64 * 1024;

/// Time a process gets to exit after SIGTERM before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;
type SharedChild = Arc<Mutex<Option<Child>>>;

/// Transport over a spawned server process.
pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    max_output: usize,
    shutdown_grace: Duration,
    log: ServerLog,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    stdin: SharedStdin,
    child: SharedChild,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport; nothing is spawned until `connect`.
    pub fn new(
        server: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        log: ServerLog,
    ) -> Self {
        Self {
            server: server.into(),
            command: command.into(),
            args,
            env,
            max_output: DEFAULT_MAX_OUTPUT,
            shutdown_grace: SHUTDOWN_GRACE,
            log,
            pending: Arc::new(PendingRequests::new()),
            connected: Arc::new(AtomicBool::new(false)),
            stdin: Arc::new(Mutex::new(None)),
            child: Arc::new(Mutex::new(None)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Override the output ceiling.
    pub fn with_max_output(mut self, limit: usize) -> Self {
        self.max_output = limit;
        self
    }

    /// Override the SIGTERM grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// OS process id while the process is running.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    async fn send_line(&self, line: &str) -> McpResult<()> {
        if let Err(e) = write_line(&self.stdin, line).await {
            warn!(server = %self.server, error = %e, "Failed to write to server stdin");
            self.connected.store(false, Ordering::SeqCst);
            self.log.event(format!("write failed: {e}"));
            self.pending
                .reject_all(McpError::transport_closed(format!("write failed: {e}")));
            return Err(McpError::transport_closed(format!("write failed: {e}")));
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

        let line = match serde_json::to_string(&JsonRpcRequest::new(id, method, params)) {
            Ok(line) => line,
            Err(e) => {
                self.pending.remove(id);
                return Err(e.into());
            }
        };

        debug!(server = %self.server, id, method = %method, "Sending request");
        self.send_line(&line).await?;
        self.pending.wait(id, rx, timeout).await
    }
}

async fn write_line(stdin: &Mutex<Option<ChildStdin>>, line: &str) -> std::io::Result<()> {
    let mut guard = stdin.lock().await;
    let Some(stdin) = guard.as_mut() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "stdin is closed",
        ));
    };
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// State the stdout reader task needs.
struct StdoutReader {
    server: String,
    max_output: usize,
    log: ServerLog,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    stdin: SharedStdin,
    child: SharedChild,
}

impl StdoutReader {
    async fn run(self, stdout: ChildStdout) {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), self.max_output);
        let mut frames = FramedRead::new(stdout, codec);

        let reason = loop {
            match frames.next().await {
                Some(Ok(frame)) => {
                    let text = String::from_utf8_lossy(&frame);
                    if let Some(reply) = dispatch_message(&self.server, &text, &self.pending) {
                        self.reply(reply).await;
                    }
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    self.overflow().await;
                    return;
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => break format!("read failed: {e}"),
                None => break "server process exited".to_string(),
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        let status = match self.child.lock().await.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => format!(" ({status})"),
            _ => String::new(),
        };
        info!(server = %self.server, reason = %reason, "Server stdout closed");
        self.log.event(format!("{reason}{status}"));
        self.pending.reject_all(McpError::transport_closed(reason));
    }

    async fn reply(&self, reply: JsonRpcResponse) {
        let line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                warn!(server = %self.server, error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = write_line(&self.stdin, &line).await {
            warn!(server = %self.server, error = %e, "Failed to reply to server request");
        }
    }

    async fn overflow(&self) {
        error!(
            server = %self.server,
            limit = self.max_output,
            "Server output exceeded limit, killing process"
        );
        self.connected.store(false, Ordering::SeqCst);
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!(server = %self.server, error = %e, "Failed to kill server process");
            }
        }
        self.log.event(format!(
            "output exceeded {} bytes; process killed",
            self.max_output
        ));
        self.pending.reject_all(McpError::OutputLimitExceeded {
            limit: self.max_output,
        });
    }
}

/// Drains stderr until EOF, decoding lossily with each line capped.
async fn read_stderr(stderr: ChildStderr, log: ServerLog) {
    let mut reader = BufReader::new(stderr);
    let mut chunk = Vec::new();
    let mut skipping = false;

    loop {
        chunk.clear();
        let read = (&mut reader)
            .take(MAX_STDERR_LINE as u64)
            .read_until(b'\n', &mut chunk)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let ends_line = chunk.last() == Some(&b'\n');
                let overlong = !ends_line && chunk.len() >= MAX_STDERR_LINE;
                if !skipping {
                    let text = String::from_utf8_lossy(&chunk);
                    let text = text.trim_end_matches(['\n', '\r']);
                    if overlong {
                        debug!(limit = MAX_STDERR_LINE, "Truncating long stderr line");
                        log.stderr(format!("{text} [truncated]"));
                    } else {
                        log.stderr(text.to_string());
                    }
                }
                skipping = overlong || (skipping && !ends_line);
            }
            Err(e) => {
                debug!(error = %e, "Server stderr read failed");
                break;
            }
        }
    }
}

/// SIGTERM, wait for the grace period, then kill. Always reaps.
async fn terminate(server: &str, child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(server = %server, %status, "Server process already exited");
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(server = %server, error = %e, "Failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(server = %server, %status, "Server process exited"),
        Ok(Err(e)) => warn!(server = %server, error = %e, "Failed to wait for server process"),
        Err(_) => {
            warn!(server = %server, grace = ?grace, "Server ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(server = %server, error = %e, "Failed to kill server process");
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> McpResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(server = %self.server, command = %self.command, args = ?self.args, "Starting server process");

        let mut child = cmd.spawn().map_err(|e| {
            McpError::ProcessError(format!("Failed to start '{}': {e}", self.command))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            return Err(McpError::ProcessError(
                "Failed to capture process pipes".to_string(),
            ));
        };

        self.log.event(format!(
            "spawned '{}' (pid {})",
            self.command,
            child.id().map_or_else(|| "?".to_string(), |p| p.to_string())
        ));

        self.pending.reopen();
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.connected.store(true, Ordering::SeqCst);

        let reader = StdoutReader {
            server: self.server.clone(),
            max_output: self.max_output,
            log: self.log.clone(),
            pending: self.pending.clone(),
            connected: self.connected.clone(),
            stdin: self.stdin.clone(),
            child: self.child.clone(),
        };
        self.track(tokio::spawn(reader.run(stdout)));
        self.track(tokio::spawn(read_stderr(stderr, self.log.clone())));

        Ok(())
    }

    async fn disconnect(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        // Dropping stdin closes the pipe, which well-behaved servers treat as EOF.
        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            terminate(&self.server, &mut child, self.shutdown_grace).await;
            self.log.event("process stopped");
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        self.pending
            .reject_all(McpError::transport_closed("transport disconnected"));
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
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        debug!(server = %self.server, method = %method, "Sending notification");
        self.send_line(&line).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}
