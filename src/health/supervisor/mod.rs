//! Service lifecycle state machine.
//!
//! `Starting → Healthy ↔ Degraded → ShuttingDown → Stopped`, driven by
//! periodic parallel probes and an explicit or signal-triggered
//! shutdown. Probes never kill the service; only a signal or a
//! `shutdown()` call does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::checkers::{HealthCheckResult, HealthChecker, run_checker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    Healthy,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", text)
    }
}

impl ServiceState {
    /// The edges of the lifecycle graph; nothing else is legal.
    fn can_transition_to(self, next: ServiceState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Healthy)
                | (Self::Healthy, Self::Degraded)
                | (Self::Degraded, Self::Healthy)
                | (Self::Starting | Self::Healthy | Self::Degraded, Self::ShuttingDown)
                | (Self::ShuttingDown, Self::Stopped)
        )
    }
}

type StateCallback = Box<dyn Fn(ServiceState, ServiceState) + Send + Sync>;
type ShutdownHook = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    pub checker_deadline: Duration,
    pub shutdown_timeout: Duration,
    /// Whether `start()` installs SIGINT/SIGTERM watchers. Off in tests.
    pub install_signal_handlers: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            checker_deadline: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            install_signal_handlers: true,
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    state: RwLock<ServiceState>,
    checkers: Vec<Arc<dyn HealthChecker>>,
    latest: RwLock<Vec<HealthCheckResult>>,
    shutdown_token: CancellationToken,
    on_state_change: Option<StateCallback>,
    on_shutdown: Option<ShutdownHook>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
    server_attached: AtomicBool,
    server_closed: AtomicBool,
    server_notify: Notify,
    // Weak self-handle so `&self` methods can hand owned clones to
    // spawned tasks. Set once by the builder.
    self_ref: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            checkers: Vec::new(),
            on_state_change: None,
            on_shutdown: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Degraded still serves traffic; only the outer states are not ready.
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ServiceState::Healthy | ServiceState::Degraded)
    }

    pub fn is_live(&self) -> bool {
        self.state() != ServiceState::Stopped
    }

    /// Token cancelled the moment shutdown begins; socket loops, probe
    /// loops, and retries all select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Latest probe results plus the overall verdict.
    pub fn snapshot(&self) -> (ServiceState, Vec<HealthCheckResult>, bool) {
        let results = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let all_ok = results.iter().all(|r| r.ok);
        (self.state(), results, all_ok)
    }

    /// Mark the moment `axum::serve` returns, so shutdown can tell a
    /// drained server from a hung one.
    pub fn attach_server(&self) {
        self.server_attached.store(true, Ordering::SeqCst);
    }

    pub fn notify_server_closed(&self) {
        self.server_closed.store(true, Ordering::SeqCst);
        self.server_notify.notify_waiters();
    }

    /// Complete startup: `Starting → Healthy`, then launch the probe
    /// ticker and (if configured) the signal watcher.
    pub fn start(&self) {
        self.transition(ServiceState::Healthy);
        let Some(supervisor) = self.self_ref.upgrade() else {
            warn!("supervisor dropped before start completed");
            return;
        };

        let probe_driver = supervisor.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_driver.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = probe_driver.shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        probe_driver.probe_all().await;
                    }
                }
            }
            debug!("probe loop exited");
        });
        *self.probe_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if self.config.install_signal_handlers {
            supervisor.spawn_signal_watcher();
        }
    }

    fn spawn_signal_watcher(self: Arc<Self>) {
        tokio::spawn(async move {
            let signalled = wait_for_termination_signal(self.shutdown_token.clone()).await;
            if !signalled {
                return;
            }
            info!("termination signal received, shutting down");
            if let Err(e) = self.shutdown().await {
                error!("shutdown after signal failed: {}", e);
            }
        });
    }

    /// Run every checker in parallel with the per-checker deadline and
    /// fold the results into Healthy/Degraded.
    pub async fn probe_all(&self) -> Vec<HealthCheckResult> {
        let deadline = self.config.checker_deadline;
        let probes = self.checkers.iter().map(|checker| {
            let checker = checker.clone();
            async move {
                match tokio::time::timeout(deadline, run_checker(checker.as_ref())).await {
                    Ok(result) => result,
                    Err(_) => HealthCheckResult {
                        name: checker.name().to_string(),
                        ok: false,
                        err: Some(format!("deadline of {:?} exceeded", deadline)),
                        at: chrono::Utc::now(),
                    },
                }
            }
        });
        let results = futures_util::future::join_all(probes).await;

        let all_ok = results.iter().all(|r| r.ok);
        for failed in results.iter().filter(|r| !r.ok) {
            warn!(
                "health probe {} failed: {}",
                failed.name,
                failed.err.as_deref().unwrap_or("unknown")
            );
        }
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = results.clone();

        match (self.state(), all_ok) {
            (ServiceState::Healthy, false) => self.transition(ServiceState::Degraded),
            (ServiceState::Degraded, true) => self.transition(ServiceState::Healthy),
            _ => {}
        }
        results
    }

    /// Cooperative shutdown: flip to `ShuttingDown`, stop the probe
    /// loop, run the pre-close hook, wait for the server to drain within
    /// the timeout, then finalize as `Stopped` either way.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transition(ServiceState::ShuttingDown);
        self.shutdown_token.cancel();

        let probe_task = self
            .probe_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = probe_task {
            let _ = handle.await;
        }

        if let Some(hook) = &self.on_shutdown {
            if let Err(e) = hook().await {
                error!("shutdown hook failed: {}", e);
            }
        }

        let mut close_result = Ok(());
        if self.server_attached.load(Ordering::SeqCst) {
            let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
                loop {
                    // Register the waiter before checking the flag so a
                    // notification between the two is not lost.
                    let notified = self.server_notify.notified();
                    if self.server_closed.load(Ordering::SeqCst) {
                        break;
                    }
                    notified.await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    "server did not close within {:?}",
                    self.config.shutdown_timeout
                );
                close_result = Err(anyhow::anyhow!(
                    "server close exceeded shutdown timeout of {:?}",
                    self.config.shutdown_timeout
                ));
            }
        }

        self.transition(ServiceState::Stopped);
        close_result
    }

    fn transition(&self, next: ServiceState) {
        let old = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let old = *state;
            if old == next {
                return;
            }
            if !old.can_transition_to(next) {
                warn!("ignoring illegal state transition {} -> {}", old, next);
                return;
            }
            *state = next;
            old
        };
        info!("service state: {} -> {}", old, next);
        if let Some(callback) = &self.on_state_change {
            callback(old, next);
        }
    }
}

/// Wait for SIGINT or SIGTERM; returns false if the token cancels first.
async fn wait_for_termination_signal(cancel: CancellationToken) -> bool {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!("cannot install SIGTERM handler: {}", e);
                return false;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = term.recv() => true,
            () = cancel.cancelled() => false,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            () = cancel.cancelled() => false,
        }
    }
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    checkers: Vec<Arc<dyn HealthChecker>>,
    on_state_change: Option<StateCallback>,
    on_shutdown: Option<ShutdownHook>,
}

impl SupervisorBuilder {
    pub fn with_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn on_state_change(
        mut self,
        callback: impl Fn(ServiceState, ServiceState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    pub fn on_shutdown(
        mut self,
        hook: impl Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Arc<Supervisor> {
        Arc::new_cyclic(|self_ref| Supervisor {
            config: self.config,
            state: RwLock::new(ServiceState::Starting),
            checkers: self.checkers,
            latest: RwLock::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            on_state_change: self.on_state_change,
            on_shutdown: self.on_shutdown,
            probe_task: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
            server_attached: AtomicBool::new(false),
            server_closed: AtomicBool::new(false),
            server_notify: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }
}
