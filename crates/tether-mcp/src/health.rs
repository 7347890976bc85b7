//! Health monitoring and automatic restart of registered servers.
//!
//! The monitor polls a [`ServerRegistry`] on its own schedule: immediately on
//! start, then quickly for the first few rounds, then at a slower steady
//! interval. Each server moves through a phase machine
//!
//! ```text
//! stopped -> starting -> connecting -> health-check (xN) -> connected
//!                                          ^                  |
//!                                          |        N failures v
//!                                   unhealthy / error <--------+
//! ```
//!
//! and servers in `unhealthy` or `error` are restarted with exponential
//! backoff until a maximum attempt count is reached.

use crate::client::ServerStatus;
use crate::config::{HealthConfig, ServerConfig};
use crate::error::{McpError, McpResult};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the monitor needs from the client.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Registered server names.
    async fn server_names(&self) -> Vec<String>;

    /// Current status; unknown names report `Disconnected`.
    async fn server_status(&self, name: &str) -> ServerStatus;

    /// Configuration a server was registered with.
    async fn server_config(&self, name: &str) -> Option<ServerConfig>;

    async fn stop_server(&self, name: &str);

    async fn start_server(&self, name: &str, config: ServerConfig) -> McpResult<()>;
}

/// Fine-grained connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthPhase {
    Stopped,
    Starting,
    Connecting,
    HealthCheck,
    Connected,
    Unhealthy,
    Error,
}

impl std::fmt::Display for HealthPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Connecting => "connecting",
            Self::HealthCheck => "health-check",
            Self::Connected => "connected",
            Self::Unhealthy => "unhealthy",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Exponential restart backoff, kept as plain state and checked on each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    /// Delay after `failures` consecutive failed restarts: `min(initial * 2^failures, max)`.
    pub fn delay_after(initial: Duration, max: Duration, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| initial.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }

    /// Current delay.
    pub fn current(&self) -> Duration {
        Self::delay_after(self.initial, self.max, self.failures)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Whether the window measured from `since` has elapsed at `now`.
    pub fn is_ready(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) >= self.current()
    }
}

/// Health bookkeeping for one server.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub name: String,
    pub last_status: ServerStatus,
    pub phase: HealthPhase,
    /// When the current phase was entered.
    pub phase_since: Instant,
    pub consecutive_failures: u32,
    pub health_check_successes: u32,
    pub restart_attempts: u32,
    pub backoff: RestartBackoff,
    pub last_check: Option<Instant>,
    pub last_restart: Option<Instant>,
    /// Set once the attempt limit is hit; cleared by `reset` or `restart`.
    pub restarts_exhausted: bool,
    /// Last-known configuration, used for restarts.
    pub config: Option<ServerConfig>,
}

impl HealthState {
    fn new(name: &str, config: &HealthConfig, now: Instant) -> Self {
        Self {
            name: name.to_string(),
            last_status: ServerStatus::Disconnected,
            phase: HealthPhase::Stopped,
            phase_since: now,
            consecutive_failures: 0,
            health_check_successes: 0,
            restart_attempts: 0,
            backoff: RestartBackoff::new(config.initial_backoff(), config.max_backoff()),
            last_check: None,
            last_restart: None,
            restarts_exhausted: false,
            config: None,
        }
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    fn fail(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures >= threshold
    }

    /// Advance the phase machine by at most one step.
    fn observe(
        &mut self,
        status: ServerStatus,
        config: &HealthConfig,
        now: Instant,
    ) -> Option<HealthEvent> {
        use HealthPhase as P;
        use ServerStatus as S;

        self.last_status = status;
        self.last_check = Some(now);
        if status == S::Connected {
            self.consecutive_failures = 0;
        }

        let threshold = config.failure_threshold.max(1);
        let next = match (self.phase, status) {
            (P::Stopped, S::Starting | S::Connected) => Some(P::Starting),
            (P::Stopped, S::Error) => Some(P::Error),
            // A known server that died before its first check still needs a restart.
            (P::Stopped, S::Disconnected) if self.config.is_some() => {
                self.fail(threshold).then_some(P::Unhealthy)
            }
            (P::Stopped, S::Disconnected) => None,

            (P::Starting, S::Connected) => Some(P::Connecting),
            (P::Connecting, S::Connected) => Some(P::HealthCheck),
            (P::HealthCheck, S::Connected) => {
                if self.health_check_successes >= config.health_check_successes {
                    Some(P::Connected)
                } else {
                    self.health_check_successes += 1;
                    None
                }
            }
            (P::Starting | P::Connecting | P::HealthCheck, S::Error) => Some(P::Error),
            (P::Starting | P::Connecting | P::HealthCheck, S::Disconnected) => {
                self.fail(threshold).then_some(P::Unhealthy)
            }
            (P::Starting | P::Connecting | P::HealthCheck, S::Starting) => None,

            (P::Connected, S::Connected) => None,
            (P::Connected, S::Starting) => Some(P::Starting),
            (P::Connected, S::Disconnected | S::Error) => {
                self.fail(threshold).then_some(P::Unhealthy)
            }

            (P::Unhealthy | P::Error, S::Connected) => Some(P::HealthCheck),
            (P::Unhealthy | P::Error, _) => None,
        };

        let to = next?;
        let from = self.phase;
        self.phase = to;
        self.phase_since = now;
        match to {
            P::HealthCheck => self.health_check_successes = 1,
            P::Connected => {
                // A restarted server that made it back earns a fresh budget.
                self.restart_attempts = 0;
                self.restarts_exhausted = false;
                self.backoff.reset();
            }
            _ => {}
        }
        Some(HealthEvent::PhaseChanged {
            server: self.name.clone(),
            from,
            to,
        })
    }
}

/// Something the monitor observed or did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    PhaseChanged {
        server: String,
        from: HealthPhase,
        to: HealthPhase,
    },
    RestartAttempt {
        server: String,
        attempt: u32,
    },
    RestartSucceeded {
        server: String,
        attempt: u32,
    },
    RestartFailed {
        server: String,
        attempt: u32,
        error: String,
        next_backoff: Duration,
    },
    MaxRestartsExceeded {
        server: String,
        attempts: u32,
    },
}

impl HealthEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::PhaseChanged { server, .. }
            | Self::RestartAttempt { server, .. }
            | Self::RestartSucceeded { server, .. }
            | Self::RestartFailed { server, .. }
            | Self::MaxRestartsExceeded { server, .. } => server,
        }
    }
}

impl std::fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PhaseChanged { server, from, to } => write!(f, "{server}: {from} -> {to}"),
            Self::RestartAttempt { server, attempt } => {
                write!(f, "{server}: restart attempt {attempt}")
            }
            Self::RestartSucceeded { server, attempt } => {
                write!(f, "{server}: restart {attempt} succeeded")
            }
            Self::RestartFailed {
                server,
                attempt,
                error,
                next_backoff,
            } => write!(
                f,
                "{server}: restart {attempt} failed ({error}); next try in {next_backoff:?}"
            ),
            Self::MaxRestartsExceeded { server, attempts } => {
                write!(f, "{server}: giving up after {attempts} restart attempts")
            }
        }
    }
}

type Listener = Arc<dyn Fn(&HealthEvent) + Send + Sync>;

/// Restart decided during a check.
struct PlannedRestart {
    attempt: u32,
    config: ServerConfig,
}

struct MonitorInner {
    registry: Arc<dyn ServerRegistry>,
    config: HealthConfig,
    states: RwLock<HashMap<String, HealthState>>,
    /// Names added with `monitor`, kept even when absent from the registry.
    explicit: RwLock<HashSet<String>>,
    /// Names excluded with `unmonitor`.
    excluded: RwLock<HashSet<String>>,
    /// Per-server lock held for the duration of a check or restart.
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<HealthEvent>,
    listeners: std::sync::RwLock<Vec<Listener>>,
}

impl MonitorInner {
    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, event: HealthEvent) {
        debug!(event = %event, "Health event");
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(&event);
        }
        let _ = self.events.send(event);
    }

    async fn monitored_names(&self) -> Vec<String> {
        let mut names: HashSet<String> = self.registry.server_names().await.into_iter().collect();
        names.extend(self.explicit.read().await.iter().cloned());
        let excluded = self.excluded.read().await;
        let mut names: Vec<_> = names.into_iter().filter(|n| !excluded.contains(n)).collect();
        names.sort();
        names
    }

    async fn check_all_at(&self, now: Instant, cancel: &CancellationToken) {
        let names = self.monitored_names().await;

        // Forget servers that left the registry on their own.
        {
            let explicit = self.explicit.read().await;
            let mut states = self.states.write().await;
            states.retain(|name, _| names.contains(name) || explicit.contains(name));
        }

        join_all(names.iter().map(|name| self.check_server(name, now, cancel))).await;
    }

    async fn check_server(&self, name: &str, now: Instant, cancel: &CancellationToken) {
        let lock = self.lock_for(name);
        let Ok(_guard) = lock.try_lock() else {
            debug!(server = %name, "Check or restart already in progress");
            return;
        };

        let status = self.registry.server_status(name).await;
        let config = self.registry.server_config(name).await;

        let (event, plan, exhausted) = {
            let mut states = self.states.write().await;
            let state = states
                .entry(name.to_string())
                .or_insert_with(|| HealthState::new(name, &self.config, now));
            if config.is_some() {
                state.config = config;
            }

            let event = state.observe(status, &self.config, now);
            let (plan, exhausted) = if cancel.is_cancelled() {
                (None, None)
            } else {
                self.plan_restart(state, now)
            };
            (event, plan, exhausted)
        };

        if let Some(event) = event {
            self.emit(event);
        }
        if let Some(event) = exhausted {
            self.emit(event);
        }
        if let Some(plan) = plan {
            if cancel.is_cancelled() {
                debug!(server = %name, "Monitor stopped, skipping restart");
                return;
            }
            self.perform_restart(name, plan).await;
        }
    }

    /// Decide whether a server is due for a restart.
    fn plan_restart(
        &self,
        state: &mut HealthState,
        now: Instant,
    ) -> (Option<PlannedRestart>, Option<HealthEvent>) {
        if !self.config.auto_restart
            || state.restarts_exhausted
            || !matches!(state.phase, HealthPhase::Unhealthy | HealthPhase::Error)
        {
            return (None, None);
        }

        if state.restart_attempts >= self.config.max_restart_attempts {
            state.restarts_exhausted = true;
            warn!(server = %state.name, attempts = state.restart_attempts, "Maximum restart attempts reached");
            return (
                None,
                Some(HealthEvent::MaxRestartsExceeded {
                    server: state.name.clone(),
                    attempts: state.restart_attempts,
                }),
            );
        }

        let since = state.last_restart.unwrap_or(state.phase_since);
        if !state.backoff.is_ready(since, now) {
            return (None, None);
        }
        let Some(config) = state.config.clone() else {
            debug!(server = %state.name, "No known configuration, cannot restart");
            return (None, None);
        };

        state.restart_attempts += 1;
        state.last_restart = Some(now);
        (
            Some(PlannedRestart {
                attempt: state.restart_attempts,
                config,
            }),
            None,
        )
    }

    /// Stop and start a server. The caller holds the server's lock.
    async fn perform_restart(&self, name: &str, plan: PlannedRestart) {
        info!(server = %name, attempt = plan.attempt, "Restarting server");
        self.emit(HealthEvent::RestartAttempt {
            server: name.to_string(),
            attempt: plan.attempt,
        });

        self.registry.stop_server(name).await;
        let result = self.registry.start_server(name, plan.config).await;

        let event = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(name) else {
                return;
            };
            match result {
                Ok(()) => {
                    state.consecutive_failures = 0;
                    state.backoff.reset();
                    HealthEvent::RestartSucceeded {
                        server: name.to_string(),
                        attempt: plan.attempt,
                    }
                }
                Err(e) => {
                    state.backoff.record_failure();
                    warn!(server = %name, attempt = plan.attempt, error = %e, "Restart failed");
                    HealthEvent::RestartFailed {
                        server: name.to_string(),
                        attempt: plan.attempt,
                        error: e.to_string(),
                        next_backoff: state.backoff.current(),
                    }
                }
            }
        };
        self.emit(event);
    }
}

/// Polls servers and restarts the ones that fail.
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<dyn ServerRegistry>, config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MonitorInner {
                registry,
                config,
                states: RwLock::new(HashMap::new()),
                explicit: RwLock::new(HashSet::new()),
                excluded: RwLock::new(HashSet::new()),
                locks: std::sync::Mutex::new(HashMap::new()),
                events,
                listeners: std::sync::RwLock::new(Vec::new()),
            }),
            cancel: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Start the polling loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *cancel = Some(token.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!("Health monitor started");
            let mut checks: u32 = 0;
            loop {
                // Rounds run detached so a slow restart never delays other servers.
                let round = inner.clone();
                let round_token = token.clone();
                tokio::spawn(async move {
                    round.check_all_at(Instant::now(), &round_token).await
                });

                let delay = inner.config.interval_after(checks);
                checks = checks.saturating_add(1);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!("Health monitor stopped");
        });
    }

    /// Stop the polling loop.
    pub fn stop(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Run one round now.
    pub async fn check_now(&self) {
        self.check_all_at(Instant::now()).await;
    }

    /// Run one round as if the current time were `now`.
    pub async fn check_all_at(&self, now: Instant) {
        self.inner.check_all_at(now, &CancellationToken::new()).await;
    }

    /// Track a server even when it is not registered with the client.
    pub async fn monitor(&self, name: &str) {
        self.inner.excluded.write().await.remove(name);
        self.inner.explicit.write().await.insert(name.to_string());
    }

    /// Stop tracking a server and drop its health state.
    pub async fn unmonitor(&self, name: &str) {
        self.inner.explicit.write().await.remove(name);
        self.inner.excluded.write().await.insert(name.to_string());
        self.inner.states.write().await.remove(name);
    }

    pub async fn health_state(&self, name: &str) -> Option<HealthState> {
        self.inner.states.read().await.get(name).cloned()
    }

    /// Every tracked server's health, sorted by name.
    pub async fn all_health_states(&self) -> Vec<HealthState> {
        let mut states: Vec<_> = self.inner.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    /// Call `listener` synchronously for every event.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&HealthEvent) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    /// Clear failure and restart counters so automatic restarts resume.
    pub async fn reset(&self, name: &str) {
        if let Some(state) = self.inner.states.write().await.get_mut(name) {
            state.consecutive_failures = 0;
            state.restart_attempts = 0;
            state.restarts_exhausted = false;
            state.backoff.reset();
            state.last_restart = None;
        }
    }

    /// Restart a server right away, resetting its attempt counter.
    pub async fn restart(&self, name: &str) -> McpResult<()> {
        let lock = self.inner.lock_for(name);
        let _guard = lock.lock().await;

        let config = match self.inner.registry.server_config(name).await {
            Some(config) => Some(config),
            None => self
                .inner
                .states
                .read()
                .await
                .get(name)
                .and_then(|s| s.config.clone()),
        };
        let config = config.ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        self.reset(name).await;
        info!(server = %name, "Manual restart");
        self.inner.registry.stop_server(name).await;
        self.inner.registry.start_server(name, config).await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Registry whose statuses are set by the test.
    #[derive(Default)]
    struct ScriptedRegistry {
        statuses: std::sync::Mutex<HashMap<String, ServerStatus>>,
        fail_starts: std::sync::atomic::AtomicBool,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl ScriptedRegistry {
        fn set(&self, name: &str, status: ServerStatus) {
            self.statuses
                .lock()
                .unwrap()
                .insert(name.to_string(), status);
        }
    }

    #[async_trait]
    impl ServerRegistry for ScriptedRegistry {
        async fn server_names(&self) -> Vec<String> {
            self.statuses.lock().unwrap().keys().cloned().collect()
        }

        async fn server_status(&self, name: &str) -> ServerStatus {
            self.statuses
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .unwrap_or(ServerStatus::Disconnected)
        }

        async fn server_config(&self, name: &str) -> Option<ServerConfig> {
            self.statuses
                .lock()
                .unwrap()
                .contains_key(name)
                .then(|| ServerConfig::stdio("srv", Vec::<String>::new()))
        }

        async fn stop_server(&self, _name: &str) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        async fn start_server(&self, name: &str, _config: ServerConfig) -> McpResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_starts.load(Ordering::SeqCst) {
                self.set(name, ServerStatus::Error);
                Err(McpError::connection_failed("still broken"))
            } else {
                self.set(name, ServerStatus::Connected);
                Ok(())
            }
        }
    }

    fn monitor(registry: Arc<ScriptedRegistry>) -> HealthMonitor {
        HealthMonitor::new(registry, HealthConfig::default())
    }

    async fn phase(monitor: &HealthMonitor, name: &str) -> HealthPhase {
        monitor.health_state(name).await.unwrap().phase
    }

    #[test]
    fn test_backoff_formula() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let mut backoff = RestartBackoff::new(initial, max);

        for n in 0..10u32 {
            let expected = (initial * 2u32.pow(n)).min(max);
            assert_eq!(backoff.current(), expected, "after {n} failures");
            backoff.record_failure();
        }
        backoff.reset();
        assert_eq!(backoff.current(), initial);

        assert_eq!(RestartBackoff::delay_after(initial, max, 200), max);
    }

    #[test]
    fn test_backoff_readiness() {
        let backoff = RestartBackoff::new(Duration::from_secs(2), Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(!backoff.is_ready(t0, t0 + Duration::from_secs(1)));
        assert!(backoff.is_ready(t0, t0 + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_clean_start_phase_sequence() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Connected);
        let monitor = monitor(registry);

        let mut phases = Vec::new();
        let t0 = Instant::now();
        for i in 0..8 {
            monitor.check_all_at(t0 + Duration::from_secs(i)).await;
            phases.push(phase(&monitor, "fs").await);
        }

        use HealthPhase::*;
        assert_eq!(
            phases,
            vec![
                Starting,
                Connecting,
                HealthCheck,
                HealthCheck,
                HealthCheck,
                Connected,
                Connected,
                Connected
            ]
        );
    }

    #[tokio::test]
    async fn test_phase_events_emitted() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Connected);
        let monitor = monitor(registry);
        let mut rx = monitor.subscribe();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.add_listener(move |event| sink.lock().unwrap().push(event.clone()));

        for _ in 0..6 {
            monitor.check_now().await;
        }

        let transitions: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                HealthEvent::PhaseChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        use HealthPhase::*;
        assert_eq!(
            transitions,
            vec![
                (Stopped, Starting),
                (Starting, Connecting),
                (Connecting, HealthCheck),
                (HealthCheck, Connected)
            ]
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.server(), "fs");
    }

    #[tokio::test]
    async fn test_three_failures_demote_and_restart() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Connected);
        let monitor = monitor(registry.clone());

        let t0 = Instant::now();
        for i in 0..6 {
            monitor.check_all_at(t0 + Duration::from_secs(i)).await;
        }
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::Connected);

        registry.set("fs", ServerStatus::Disconnected);
        monitor.check_all_at(t0 + Duration::from_secs(6)).await;
        monitor.check_all_at(t0 + Duration::from_secs(7)).await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::Connected);

        // Third failure demotes; backoff has not elapsed yet.
        monitor.check_all_at(t0 + Duration::from_secs(8)).await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::Unhealthy);
        assert_eq!(registry.starts.load(Ordering::SeqCst), 0);

        // One second later the restart is issued and succeeds.
        monitor.check_all_at(t0 + Duration::from_secs(9)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stops.load(Ordering::SeqCst), 1);
        let state = monitor.health_state("fs").await.unwrap();
        assert_eq!(state.restart_attempts, 1);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.current_backoff(), Duration::from_secs(1));

        // Recovery goes through health-check again, then resets the attempt counter.
        monitor.check_all_at(t0 + Duration::from_secs(10)).await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::HealthCheck);
        for i in 11..14 {
            monitor.check_all_at(t0 + Duration::from_secs(i)).await;
        }
        let state = monitor.health_state("fs").await.unwrap();
        assert_eq!(state.phase, HealthPhase::Connected);
        assert_eq!(state.restart_attempts, 0);
    }

    #[tokio::test]
    async fn test_disconnected_before_first_check_is_restarted() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Disconnected);
        let monitor = monitor(registry.clone());

        let t0 = Instant::now();
        monitor.check_all_at(t0).await;
        monitor.check_all_at(t0 + Duration::from_secs(1)).await;
        let state = monitor.health_state("fs").await.unwrap();
        assert_eq!(state.phase, HealthPhase::Stopped);
        assert_eq!(state.consecutive_failures, 2);

        monitor.check_all_at(t0 + Duration::from_secs(2)).await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::Unhealthy);
        assert_eq!(registry.starts.load(Ordering::SeqCst), 0);

        monitor.check_all_at(t0 + Duration::from_secs(3)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stops.load(Ordering::SeqCst), 1);

        monitor.check_all_at(t0 + Duration::from_secs(4)).await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::HealthCheck);
    }

    #[tokio::test]
    async fn test_cancelled_round_does_not_restart() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Error);
        let monitor = monitor(registry.clone());

        let stopped = CancellationToken::new();
        stopped.cancel();
        let t0 = Instant::now();
        monitor.inner.check_all_at(t0, &stopped).await;
        monitor
            .inner
            .check_all_at(t0 + Duration::from_secs(5), &stopped)
            .await;
        let state = monitor.health_state("fs").await.unwrap();
        assert_eq!(state.phase, HealthPhase::Error);
        assert_eq!(state.restart_attempts, 0);
        assert_eq!(registry.starts.load(Ordering::SeqCst), 0);
        assert_eq!(registry.stops.load(Ordering::SeqCst), 0);

        monitor.check_all_at(t0 + Duration::from_secs(6)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_restarts_back_off_then_give_up() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Error);
        registry.fail_starts.store(true, Ordering::SeqCst);
        let monitor = monitor(registry.clone());
        let mut events = monitor.subscribe();

        let t0 = Instant::now();
        let at = |secs: u64| t0 + Duration::from_secs(secs);

        monitor.check_all_at(at(0)).await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::Error);

        // Attempt 1 after the initial 1s window.
        monitor.check_all_at(at(1)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
        let state = monitor.health_state("fs").await.unwrap();
        assert_eq!(state.current_backoff(), Duration::from_secs(2));

        // Not ready until 2s after the last attempt.
        monitor.check_all_at(at(2)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
        monitor.check_all_at(at(3)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 2);
        assert_eq!(
            monitor.health_state("fs").await.unwrap().current_backoff(),
            Duration::from_secs(4)
        );

        monitor.check_all_at(at(7)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 3);

        // Limit reached: one terminal event, then nothing more.
        monitor.check_all_at(at(100)).await;
        monitor.check_all_at(at(200)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 3);
        assert!(monitor.health_state("fs").await.unwrap().restarts_exhausted);

        let mut exceeded = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HealthEvent::MaxRestartsExceeded { .. }) {
                exceeded += 1;
            }
        }
        assert_eq!(exceeded, 1);

        // A manual restart resets the budget.
        registry.fail_starts.store(false, Ordering::SeqCst);
        monitor.restart("fs").await.unwrap();
        let state = monitor.health_state("fs").await.unwrap();
        assert_eq!(state.restart_attempts, 0);
        assert!(!state.restarts_exhausted);
    }

    #[tokio::test]
    async fn test_restart_lock_skips_concurrent_check() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Connected);
        let monitor = monitor(registry);

        let lock = monitor.inner.lock_for("fs");
        let guard = lock.lock().await;
        monitor.check_now().await;
        assert!(monitor.health_state("fs").await.is_none());
        drop(guard);

        monitor.check_now().await;
        assert_eq!(phase(&monitor, "fs").await, HealthPhase::Starting);
    }

    #[tokio::test]
    async fn test_monitor_and_unmonitor() {
        let registry = Arc::new(ScriptedRegistry::default());
        let monitor = monitor(registry.clone());

        monitor.monitor("ghost").await;
        monitor.check_now().await;
        assert_eq!(phase(&monitor, "ghost").await, HealthPhase::Stopped);

        registry.set("fs", ServerStatus::Connected);
        monitor.unmonitor("fs").await;
        monitor.check_now().await;
        assert!(monitor.health_state("fs").await.is_none());

        let names: Vec<_> = monitor
            .all_health_states()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["ghost"]);
    }

    #[tokio::test]
    async fn test_auto_restart_disabled() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Error);
        let monitor = HealthMonitor::new(
            registry.clone(),
            HealthConfig {
                auto_restart: false,
                ..HealthConfig::default()
            },
        );
        let t0 = Instant::now();
        monitor.check_all_at(t0).await;
        monitor.check_all_at(t0 + Duration::from_secs(30)).await;
        assert_eq!(registry.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loop_start_stop() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.set("fs", ServerStatus::Connected);
        let monitor = monitor(registry);

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        let mut found = false;
        for _ in 0..50 {
            if monitor.health_state("fs").await.is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
