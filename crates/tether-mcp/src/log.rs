//! Bounded per-server log buffer.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default number of retained lines.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Origin of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Lifecycle events recorded by the client or transport.
    Lifecycle,
    /// Diagnostic output from a subprocess.
    Stderr,
}

/// One captured line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.source {
            LogSource::Lifecycle => "event",
            LogSource::Stderr => "stderr",
        };
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            tag,
            self.message
        )
    }
}

/// Circular buffer of recent log lines, shared between a server entry and its transport.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct ServerLog {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for ServerLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl ServerLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    /// Record a lifecycle event.
    pub fn event(&self, message: impl Into<String>) {
        self.push(LogSource::Lifecycle, message.into());
    }

    /// Record a line of subprocess diagnostic output.
    pub fn stderr(&self, message: impl Into<String>) {
        self.push(LogSource::Stderr, message.into());
    }

    fn push(&self, source: LogSource, message: String) {
        let mut lines = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogEntry {
            timestamp: Utc::now(),
            source,
            message,
        });
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let lines = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
