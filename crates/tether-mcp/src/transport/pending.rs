//! In-flight request bookkeeping shared by the multiplexed transports.

use super::ProgressSink;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcResponse, ProgressParams};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

type Completion = oneshot::Sender<McpResult<JsonRpcResponse>>;

struct PendingEntry {
    tx: Completion,
    progress: Option<ProgressSink>,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<u64, PendingEntry>,
    /// Set once the transport has failed; new registrations are refused with it.
    closed: Option<McpError>,
}

/// Map from request id to completion handle.
///
/// Every entry is resolved exactly once: by a matching response, by its
/// timeout, or by `reject_all` when the transport goes away.
pub struct PendingRequests {
    next_id: AtomicU64,
    state: Mutex<PendingState>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(PendingState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an id and register a completion handle for it.
    pub fn register(
        &self,
        progress: Option<ProgressSink>,
    ) -> McpResult<(u64, oneshot::Receiver<McpResult<JsonRpcResponse>>)> {
        let mut state = self.lock();
        if let Some(err) = &state.closed {
            return Err(err.duplicate());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        state.entries.insert(id, PendingEntry { tx, progress });
        Ok((id, rx))
    }

    /// Resolve the request matching `response.id`.
    ///
    /// Returns `false` if no such request is pending.
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let entry = self.lock().entries.remove(&response.id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Hand a progress notification to the streaming request it belongs to.
    pub fn route_progress(&self, params: ProgressParams) -> bool {
        let Some(id) = params.request_id() else {
            return false;
        };
        let sink = self
            .lock()
            .entries
            .get(&id)
            .and_then(|entry| entry.progress.clone());
        match sink {
            Some(sink) => {
                sink(params);
                true
            }
            None => false,
        }
    }

    /// Fail a single request.
    pub fn reject(&self, id: u64, err: McpError) {
        if let Some(entry) = self.lock().entries.remove(&id) {
            let _ = entry.tx.send(Err(err));
        }
    }

    /// Forget a request without resolving it.
    pub fn remove(&self, id: u64) {
        self.lock().entries.remove(&id);
    }

    /// Fail every pending request and refuse new ones until `reopen`.
    pub fn reject_all(&self, err: McpError) {
        let entries: Vec<_> = {
            let mut state = self.lock();
            let drained = state.entries.drain().map(|(_, e)| e).collect();
            state.closed = Some(err.duplicate());
            drained
        };
        if !entries.is_empty() {
            debug!(count = entries.len(), error = %err, "Rejecting pending requests");
        }
        for entry in entries {
            let _ = entry.tx.send(Err(err.duplicate()));
        }
    }

    /// Accept registrations again after a fresh connect.
    pub fn reopen(&self) {
        self.lock().closed = None;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the response to `id`, removing the entry on timeout.
    pub async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<McpResult<JsonRpcResponse>>,
        timeout: Duration,
    ) -> McpResult<JsonRpcResponse> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::transport_closed("request was dropped")),
            Err(_) => {
                self.remove(id);
                Err(McpError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_sequential() {
        let pending = PendingRequests::new();
        let (a, _ra) = pending.register(None).unwrap();
        let (b, _rb) = pending.register(None).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_only_matching() {
        let pending = PendingRequests::new();
        let (a, ra) = pending.register(None).unwrap();
        let (b, rb) = pending.register(None).unwrap();

        assert!(pending.complete(JsonRpcResponse::success(b, json!("b"))));
        assert!(!pending.complete(JsonRpcResponse::success(99, json!("x"))));

        let resp = rb.await.unwrap().unwrap();
        assert_eq!(resp.id, b);
        assert_eq!(pending.len(), 1);

        pending.complete(JsonRpcResponse::success(a, json!("a")));
        assert_eq!(ra.await.unwrap().unwrap().result, Some(json!("a")));
    }

    #[tokio::test]
    async fn test_reject_all_closes() {
        let pending = PendingRequests::new();
        let (_, r1) = pending.register(None).unwrap();
        let (_, r2) = pending.register(None).unwrap();

        pending.reject_all(McpError::OutputLimitExceeded { limit: 8 });

        for rx in [r1, r2] {
            assert!(matches!(
                rx.await.unwrap(),
                Err(McpError::OutputLimitExceeded { limit: 8 })
            ));
        }
        assert!(pending.is_empty());
        assert!(matches!(
            pending.register(None),
            Err(McpError::OutputLimitExceeded { .. })
        ));

        pending.reopen();
        assert!(pending.register(None).is_ok());
    }

    #[tokio::test]
    async fn test_wait_times_out_and_removes() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register(None).unwrap();
        let result = pending.wait(id, rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(McpError::Timeout(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_route_progress() {
        let pending = PendingRequests::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink: ProgressSink = Arc::new(move |_: ProgressParams| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (id, _rx) = pending.register(Some(sink)).unwrap();
        let (plain, _rx2) = pending.register(None).unwrap();

        let params = |token: u64| ProgressParams {
            progress_token: json!(token),
            progress: Some(1.0),
            total: None,
            message: None,
        };
        assert!(pending.route_progress(params(id)));
        assert!(!pending.route_progress(params(plain)));
        assert!(!pending.route_progress(params(1234)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
