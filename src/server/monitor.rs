//! Periodic health monitoring of a running backend.
//!
//! The monitor runs only while the backend is in the running state. It
//! detects silent crashes and hangs that the exit watcher cannot see, and
//! reports the first failure to the supervision loop, after which it stops
//! itself; recovery starts a fresh monitor once the backend is healthy
//! again. This guarantees a single failure never triggers recovery twice.

use crate::server::health::HealthProbe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Delay between health checks.
    pub check_interval: Duration,
    /// Per-request timeout for each health check.
    pub request_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Watches a running backend and reports the first health failure.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl HealthMonitor {
    /// Create a stopped monitor.
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            task: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the monitor task is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start monitoring through `probe`, invoking `on_failure` exactly once
    /// when a check fails. A no-op if already started.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, probe, on_failure))]
    pub fn start<F>(&mut self, probe: HealthProbe, on_failure: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Health monitor already running");
            return;
        }

        let running = Arc::clone(&self.running);
        let interval = self.config.check_interval;
        let request_timeout = self.config.request_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so the backend
            // gets a full interval of quiet after reaching running.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if probe.check(request_timeout).await {
                    tracing::trace!("Periodic health check passed");
                    continue;
                }
                tracing::warn!("Periodic health check failed");
                running.store(false, Ordering::SeqCst);
                on_failure();
                break;
            }
        });
        self.task = Some(task);
    }

    /// Stop the monitor. Idempotent; stopping a monitor that was never
    /// started, or stopping twice, is a no-op.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Health monitor stopped");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
