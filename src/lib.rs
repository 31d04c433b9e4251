/*!
 # Studio Backend

 A Rust library for launching and supervising the local analysis server
 behind the Studio desktop application.

 ## Overview

 Studio Backend provides functionality to:
 - Locate a runtime for the analysis server (dev interpreter, provisioned
   runtime, or standalone packaged executable)
 - Provision a private language runtime on first launch
 - Spawn the server on a dynamically allocated loopback port
 - Probe readiness and monitor health, restarting on crash with a bounded
   retry policy
 - Tear the server down gracefully, escalating to a forced kill on timeout

 ## Basic Usage

 ```no_run
 use studio_backend::{BackendConfig, BackendManager, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     let config = BackendConfig::new(
         "/home/user/.local/share/studio",
         "/opt/studio/resources",
         "/home/user/src/studio-server",
     );
     let manager = BackendManager::new(config)?;

     // Watch lifecycle notifications
     let mut events = manager.subscribe();
     tokio::spawn(async move {
         while let Ok(event) = events.recv().await {
             println!("backend event: {:?}", event);
         }
     });

     // Start the backend and wait for readiness
     let port = manager.start().await?;
     println!("backend listening on 127.0.0.1:{}", port);

     // Later, shut it down
     manager.stop().await;
     Ok(())
 }
 ```

 ## Features

 - **Process Supervision**: Spawn, monitor, and terminate the server process
 - **Crash Recovery**: Bounded automatic restarts with status notifications
 - **Runtime Provisioning**: Self-contained interpreter setup with progress
 - **Error Handling**: Comprehensive error handling
 - **Async Support**: Full async/await support

 ## License

 This project is licensed under the terms in the LICENSE file.
*/

pub mod config;
pub mod error;
pub mod runtime;
pub mod server;

pub use config::{BackendConfig, BackendTunables, Settings};
pub use error::{Error, Result};
pub use runtime::{EnvironmentInfo, ProvisionConfig, RuntimeStatus, SetupPhase};
pub use server::{BackendId, HealthProbe, MlReadiness};

use crate::runtime::{probe_environment, validate_existing_environment, RuntimeProvisioner};
use crate::server::{
    allocate_port, locator, BackendProcess, HealthMonitor, HealthMonitorConfig, LaunchSource,
};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

/// Capacity of the lifecycle notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of the managed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// No backend process exists.
    Stopped,
    /// Spawn and readiness probe in progress.
    Starting,
    /// Backend is serving and monitored.
    Running,
    /// Backend failed; requires an explicit start or restart.
    Error,
    /// Automatic crash recovery in progress.
    Restarting,
    /// No runtime is available; provisioning is needed first.
    SetupRequired,
}

/// Immutable snapshot of the manager's observable state.
///
/// A projection derived on demand; it has no lifecycle of its own.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    /// Current lifecycle state.
    pub status: BackendStatus,
    /// Port the backend was launched on (0 before the first start).
    pub port: u16,
    /// Base URL of the backend, empty before the first start.
    pub url: String,
    /// Message of the most recent failure, if any.
    pub error: Option<String>,
    /// Automatic recovery attempts since the last explicit start.
    pub restart_count: u32,
}

/// Notification pushed to subscribers on every observable transition.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// The lifecycle state changed; carries a full snapshot.
    StatusChanged(BackendInfo),
    /// The ML readiness tier resolved, one way or the other.
    MlReadiness {
        /// Whether the ML tier became available.
        ready: bool,
        /// Present when the poll gave up without the tier coming up.
        error: Option<String>,
    },
}

/// Failure reports delivered to the supervision loop.
#[derive(Debug)]
enum SupervisionMsg {
    /// The periodic health check failed.
    HealthFailed { generation: u64 },
    /// The process exited on its own.
    ProcessExited { generation: u64, exit: String },
}

struct ManagerState {
    status: BackendStatus,
    port: u16,
    last_error: Option<String>,
    restart_count: u32,
    shutting_down: bool,
    update_quit: bool,
    /// Incremented on every spawn; stale watcher/monitor reports are
    /// discarded by comparing against it.
    generation: u64,
}

struct Inner {
    config: BackendConfig,
    state: Mutex<ManagerState>,
    child: AsyncMutex<Option<BackendProcess>>,
    monitor: Mutex<HealthMonitor>,
    environment: Mutex<EnvironmentInfo>,
    settings: Mutex<Settings>,
    events: broadcast::Sender<BackendEvent>,
    supervision: mpsc::UnboundedSender<SupervisionMsg>,
    http: reqwest::Client,
}

/// Supervises the local analysis server for the Studio shell.
///
/// This struct is the main entry point for managing the backend lifecycle.
/// Construct one instance at application startup and inject it wherever the
/// IPC/RPC handlers are registered; all methods take `&self`.
/// All public methods are instrumented with `tracing` spans.
pub struct BackendManager {
    inner: Arc<Inner>,
}

impl BackendManager {
    /// Create a new backend manager.
    ///
    /// Loads the persisted settings record and probes the filesystem for a
    /// previously provisioned (or user-supplied) runtime, so provisioning
    /// survives a relaunch. Must be called within a Tokio runtime; the
    /// supervision task is spawned here.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub fn new(config: BackendConfig) -> Result<Self> {
        tracing::info!("Creating new BackendManager");
        let settings = Settings::load(&config.data_dir)?;
        let environment = probe_environment(&config.data_dir, &settings);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (supervision, supervision_rx) = mpsc::unbounded_channel();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;

        let inner = Arc::new(Inner {
            monitor: Mutex::new(HealthMonitor::new(HealthMonitorConfig {
                check_interval: config.tunables.monitor_interval,
                request_timeout: config.tunables.monitor_request_timeout,
            })),
            config,
            state: Mutex::new(ManagerState {
                status: BackendStatus::Stopped,
                port: 0,
                last_error: None,
                restart_count: 0,
                shutting_down: false,
                update_quit: false,
                generation: 0,
            }),
            child: AsyncMutex::new(None),
            environment: Mutex::new(environment),
            settings: Mutex::new(settings),
            events,
            supervision,
            http,
        });
        Inner::spawn_supervisor(&inner, supervision_rx);
        Ok(Self { inner })
    }

    /// Start the backend and block until it reports core readiness.
    ///
    /// Returns the port the backend was launched on. A no-op with a warning
    /// when the backend is already running (or mid-start); the current port
    /// is returned and no second process is spawned.
    ///
    /// Start-time failures (port allocation, spawn, readiness timeout) are
    /// returned as errors; after this method succeeds, failures only
    /// surface through status notifications.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<u16> {
        let port = match self.begin_start().await? {
            StartOutcome::AlreadyRunning(port) => return Ok(port),
            StartOutcome::Starting(port) => port,
        };
        match Inner::spawn_and_probe(&self.inner, port).await {
            Ok(generation) => {
                Inner::enter_running(&self.inner, port, generation);
                Ok(port)
            }
            Err(e) => {
                Inner::record_start_failure(&self.inner, &e);
                Err(e)
            }
        }
    }

    /// Start the backend without waiting for readiness.
    ///
    /// Allocates and returns the port immediately; spawning and probing
    /// continue in the background with transitions delivered through the
    /// notification channel. Lets a UI shell render before the backend is
    /// confirmed healthy.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn start_non_blocking(&self) -> Result<u16> {
        let port = match self.begin_start().await? {
            StartOutcome::AlreadyRunning(port) => return Ok(port),
            StartOutcome::Starting(port) => port,
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match Inner::spawn_and_probe(&inner, port).await {
                Ok(generation) => Inner::enter_running(&inner, port, generation),
                Err(e) => {
                    tracing::error!(error = %e, "Background start failed");
                    Inner::record_start_failure(&inner, &e);
                }
            }
        });
        Ok(port)
    }

    /// Stop the backend.
    ///
    /// Idempotent. Marks the shutdown in progress so the exit watcher does
    /// not mistake the teardown for a crash, cancels the health monitor,
    /// and terminates the process, escalating to a forced kill when the
    /// graceful path stalls. Always resolves.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        // The shutdown flag must be visible before any termination signal,
        // otherwise the exit watcher treats the teardown as a crash.
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutting_down = true;
        }
        self.inner.monitor.lock().unwrap().stop();

        let tree_kill = {
            let state = self.inner.state.lock().unwrap();
            !state.update_quit
        };
        let taken = self.inner.child.lock().await.take();
        let had_process = taken.is_some();
        if let Some(process) = taken {
            tracing::info!(backend_id = %process.id(), "Stopping backend process");
            process
                .terminate(self.inner.config.tunables.termination_grace, tree_kill)
                .await;
        }

        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            let changed = state.status != BackendStatus::Stopped;
            state.status = BackendStatus::Stopped;
            changed
        };
        if changed || had_process {
            self.inner.notify_status();
        }
        tracing::info!("Backend stopped");
    }

    /// Restart the backend: stop, reset the shutdown and retry flags, start.
    ///
    /// Resets the automatic restart counter regardless of how many recovery
    /// attempts occurred before.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self) -> Result<u16> {
        tracing::info!("Restarting backend");
        self.stop().await;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutting_down = false;
            state.restart_count = 0;
        }
        self.start().await
    }

    /// Get a snapshot of the current state. Synchronous, no side effects.
    pub fn info(&self) -> BackendInfo {
        self.inner.info()
    }

    /// Subscribe to lifecycle notifications.
    ///
    /// Every status transition pushes a [`BackendEvent::StatusChanged`]
    /// carrying a full snapshot; ML readiness resolution pushes a separate
    /// [`BackendEvent::MlReadiness`]. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    /// Signal that the application is quitting to apply an in-place update.
    ///
    /// While set, termination kills only the backend process itself and
    /// skips the process-tree walk, so a sibling updater spawned earlier
    /// survives to replace files after this process dies.
    pub fn set_update_quit(&self, update_quit: bool) {
        self.inner.state.lock().unwrap().update_quit = update_quit;
    }

    /// Get a snapshot of the managed runtime descriptor.
    pub fn environment(&self) -> EnvironmentInfo {
        self.inner.environment.lock().unwrap().clone()
    }

    /// Provision the managed runtime with default settings.
    ///
    /// See [`BackendManager::setup_runtime_with`].
    pub async fn setup_runtime<F>(&self, on_progress: F) -> Result<EnvironmentInfo>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        self.setup_runtime_with(ProvisionConfig::new(self.inner.config.data_dir.clone()), on_progress)
            .await
    }

    /// Provision the managed runtime.
    ///
    /// Downloads and extracts a redistributable interpreter, creates the
    /// isolated environment and installs the server packages, reporting
    /// `(percent, phase, detail)` through `on_progress`. Unlike post-start
    /// failures, provisioning failures propagate to the caller, since the
    /// caller is blocked on the result to unblock the user.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, provision, on_progress))]
    pub async fn setup_runtime_with<F>(
        &self,
        provision: ProvisionConfig,
        on_progress: F,
    ) -> Result<EnvironmentInfo>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        let provisioner = RuntimeProvisioner::new(provision, self.inner.http.clone());
        let inner = Arc::clone(&self.inner);
        let wrapped = move |percent: u8, phase: SetupPhase, detail: &str| {
            {
                let mut environment = inner.environment.lock().unwrap();
                environment.status = phase.runtime_status();
            }
            on_progress(percent, phase, detail);
        };
        match provisioner.setup(wrapped).await {
            Ok(environment) => {
                *self.inner.environment.lock().unwrap() = environment.clone();
                Ok(environment)
            }
            Err(e) => {
                let mut environment = self.inner.environment.lock().unwrap();
                environment.status = RuntimeStatus::Error;
                environment.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Adopt an existing interpreter environment instead of provisioning.
    ///
    /// Validates the interpreter (minimum version, best-effort analysis
    /// engine check) and persists the choice so future launches use it
    /// without touching the provisioner.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(path = %path.display()))]
    pub async fn use_existing_environment(&self, path: &Path) -> Result<EnvironmentInfo> {
        let environment = validate_existing_environment(path).await?;
        {
            let mut settings = self.inner.settings.lock().unwrap();
            settings.custom_env_path = Some(path.to_path_buf());
            settings.save(&self.inner.config.data_dir)?;
        }
        *self.inner.environment.lock().unwrap() = environment.clone();
        tracing::info!("Adopted custom environment");
        Ok(environment)
    }

    /// Guard shared by the blocking and non-blocking start paths:
    /// short-circuits when a backend already exists, otherwise resets the
    /// per-start flags and allocates the port.
    async fn begin_start(&self) -> Result<StartOutcome> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.status {
                BackendStatus::Running | BackendStatus::Starting | BackendStatus::Restarting => {
                    tracing::warn!(
                        port = state.port,
                        status = ?state.status,
                        "Backend already running, ignoring start"
                    );
                    return Ok(StartOutcome::AlreadyRunning(state.port));
                }
                _ => {}
            }
            state.status = BackendStatus::Starting;
            state.shutting_down = false;
            state.restart_count = 0;
            state.last_error = None;
        }
        self.inner.notify_status();

        let port = match self.inner.config.fixed_port {
            Some(port) => port,
            None => match allocate_port().await {
                Ok(port) => port,
                Err(e) => {
                    Inner::record_start_failure(&self.inner, &e);
                    return Err(e);
                }
            },
        };
        self.inner.state.lock().unwrap().port = port;
        tracing::info!(port, "Starting backend");
        Ok(StartOutcome::Starting(port))
    }
}

enum StartOutcome {
    AlreadyRunning(u16),
    Starting(u16),
}

impl Inner {
    fn info(&self) -> BackendInfo {
        let state = self.state.lock().unwrap();
        BackendInfo {
            status: state.status,
            port: state.port,
            url: if state.port == 0 {
                String::new()
            } else {
                format!("http://127.0.0.1:{}", state.port)
            },
            error: state.last_error.clone(),
            restart_count: state.restart_count,
        }
    }

    fn notify_status(&self) {
        let _ = self.events.send(BackendEvent::StatusChanged(self.info()));
    }

    fn probe(&self, port: u16) -> HealthProbe {
        HealthProbe::new(
            self.http.clone(),
            format!("http://127.0.0.1:{}", port),
            self.config.tunables.probe_interval,
        )
    }

    /// Record a failed explicit start. A missing runtime surfaces as
    /// `setup_required` so the shell can route the user to provisioning.
    fn record_start_failure(inner: &Arc<Inner>, error: &Error) {
        {
            let mut state = inner.state.lock().unwrap();
            state.status = match error {
                Error::SetupRequired => BackendStatus::SetupRequired,
                _ => BackendStatus::Error,
            };
            state.last_error = Some(error.to_string());
        }
        inner.notify_status();
    }

    /// Spawn the backend on `port` and block until core readiness.
    ///
    /// Returns the process generation on success. On a readiness timeout
    /// the unresponsive process is torn down so no handle leaks.
    async fn spawn_and_probe(inner: &Arc<Inner>, port: u16) -> Result<u64> {
        let environment = inner.environment.lock().unwrap().clone();
        let plan = locator::resolve(&inner.config, &environment, port);
        if plan.source == LaunchSource::DevFallback && !plan.command.exists() {
            return Err(Error::SetupRequired);
        }

        let process = BackendProcess::spawn(&plan).await?;
        let generation = {
            let mut state = inner.state.lock().unwrap();
            state.generation += 1;
            state.generation
        };
        {
            let mut slot = inner.child.lock().await;
            debug_assert!(slot.is_none(), "spawn attempted while a handle is live");
            *slot = Some(process);
        }
        Inner::spawn_exit_watcher(inner, generation);

        let probe = inner.probe(port);
        match probe
            .wait_for_ready(inner.config.tunables.ready_timeout)
            .await
        {
            Ok(()) => Ok(generation),
            Err(e) => {
                tracing::error!(error = %e, "Backend never became ready, terminating it");
                let taken = inner.child.lock().await.take();
                if let Some(process) = taken {
                    process
                        .terminate(inner.config.tunables.termination_grace, true)
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Transition to running and resume monitoring.
    fn enter_running(inner: &Arc<Inner>, port: u16, generation: u64) {
        let proceed = {
            let mut state = inner.state.lock().unwrap();
            if state.shutting_down {
                false
            } else {
                state.status = BackendStatus::Running;
                state.last_error = None;
                true
            }
        };
        if !proceed {
            // A stop raced the background start; tear the fresh process
            // down instead of entering the running state.
            tracing::warn!("Backend became ready during shutdown, terminating it");
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let taken = inner.child.lock().await.take();
                if let Some(process) = taken {
                    process
                        .terminate(inner.config.tunables.termination_grace, true)
                        .await;
                }
            });
            return;
        }
        inner.notify_status();
        tracing::info!(port, "Backend running");

        let probe = inner.probe(port);
        let failure_tx = inner.supervision.clone();
        inner.monitor.lock().unwrap().start(probe.clone(), move || {
            let _ = failure_tx.send(SupervisionMsg::HealthFailed { generation });
        });

        // ML readiness resolves in the background; the backend is usable
        // without it.
        let weak = Arc::downgrade(inner);
        let ml_timeout = inner.config.tunables.ml_ready_timeout;
        tokio::spawn(async move {
            let outcome = probe.poll_ml_readiness(ml_timeout).await;
            if let Some(inner) = weak.upgrade() {
                let (ready, error) = match outcome {
                    MlReadiness::Ready => (true, None),
                    MlReadiness::TimedOut => (
                        false,
                        Some("ML readiness poll timed out".to_string()),
                    ),
                };
                let _ = inner.events.send(BackendEvent::MlReadiness { ready, error });
            }
        });
    }

    /// Watch for the process exiting on its own. The slot emptying out or a
    /// newer generation taking over ends the watch.
    fn spawn_exit_watcher(inner: &Arc<Inner>, generation: u64) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.state.lock().unwrap().generation != generation {
                    break;
                }
                let mut slot = inner.child.lock().await;
                let Some(process) = slot.as_mut() else { break };
                match process.try_exit_status() {
                    Ok(Some(exit)) => {
                        // Handle cleared regardless of what happens next.
                        let _ = slot.take();
                        drop(slot);
                        tracing::warn!(%exit, "Backend process exited unexpectedly");
                        let _ = inner.supervision.send(SupervisionMsg::ProcessExited {
                            generation,
                            exit: exit.to_string(),
                        });
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll backend exit status");
                    }
                }
            }
        });
    }

    fn spawn_supervisor(inner: &Arc<Inner>, mut rx: mpsc::UnboundedReceiver<SupervisionMsg>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Inner::handle_failure(&inner, msg).await;
            }
        });
    }

    /// Crash recovery: bounded-retry restart triggered by a health failure
    /// or an unexpected exit.
    async fn handle_failure(inner: &Arc<Inner>, msg: SupervisionMsg) {
        let (generation, reason) = match msg {
            SupervisionMsg::HealthFailed { generation } => {
                (generation, "Backend stopped responding to health checks".to_string())
            }
            SupervisionMsg::ProcessExited { generation, exit } => {
                (generation, format!("Backend exited unexpectedly ({})", exit))
            }
        };

        // Guard and transition atomically: deliberate shutdowns, stale
        // generations, and anything but a running backend are ignored, and
        // the retry ceiling is checked before every new trigger.
        let recover = {
            let mut state = inner.state.lock().unwrap();
            if state.shutting_down || state.generation != generation {
                return;
            }
            if state.status != BackendStatus::Running {
                return;
            }
            if state.restart_count >= inner.config.tunables.max_restart_attempts {
                tracing::error!(
                    restart_count = state.restart_count,
                    "Restart limit reached, giving up on automatic recovery"
                );
                state.status = BackendStatus::Error;
                state.last_error = Some(format!("{} (restart limit reached)", reason));
                false
            } else {
                state.restart_count += 1;
                state.status = BackendStatus::Restarting;
                state.last_error = Some(reason.clone());
                tracing::warn!(
                    attempt = state.restart_count,
                    max = inner.config.tunables.max_restart_attempts,
                    %reason,
                    "Backend failed, attempting recovery"
                );
                true
            }
        };
        inner.notify_status();

        // The monitor is always stopped before a new spawn attempt so two
        // monitors never race to recover the same failure twice.
        inner.monitor.lock().unwrap().stop();
        if !recover {
            return;
        }

        // The old process is already dead; discard the handle without
        // invoking teardown.
        {
            let mut slot = inner.child.lock().await;
            let _ = slot.take();
        }

        tokio::time::sleep(inner.config.tunables.recovery_backoff).await;

        let port = inner.state.lock().unwrap().port;
        match Inner::spawn_and_probe(inner, port).await {
            Ok(new_generation) => {
                tracing::info!("Backend recovered");
                Inner::enter_running(inner, port, new_generation);
            }
            Err(e) => {
                tracing::error!(error = %e, "Recovery attempt failed");
                let changed = {
                    let mut state = inner.state.lock().unwrap();
                    if state.shutting_down {
                        false
                    } else {
                        state.status = BackendStatus::Error;
                        state.last_error = Some(e.to_string());
                        true
                    }
                };
                if changed {
                    inner.notify_status();
                }
            }
        }
    }
}
