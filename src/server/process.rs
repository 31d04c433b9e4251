//! Core process supervision for the backend instance.

use crate::error::{Error, Result};
use crate::server::locator::LaunchPlan;
use crate::server::terminate;
use async_process::{Child, Command, Stdio};
use futures_lite::{io::BufReader, AsyncBufReadExt, StreamExt};
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unique identifier for one backend process generation.
///
/// A fresh id is minted for every spawn, so log lines from an old instance
/// and its crash-recovery replacement stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(Uuid);

impl BackendId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live backend server process.
///
/// Owns the OS child handle. At most one of these exists per manager at any
/// time; the manager enforces that a new spawn never happens while a handle
/// is still considered live.
pub struct BackendProcess {
    id: BackendId,
    pid: u32,
    child: Child,
    log_tasks: Vec<JoinHandle<()>>,
}

impl BackendProcess {
    /// Spawn the backend described by `plan`.
    ///
    /// Stdout and stderr are captured and forwarded line-by-line to the
    /// structured logger. The capture is diagnostic only; readiness is
    /// determined exclusively through the health endpoint.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(plan), fields(command = %plan.command.display()))]
    pub async fn spawn(plan: &LaunchPlan) -> Result<Self> {
        let id = BackendId::new();
        tracing::info!(backend_id = %id, args = ?plan.args, "Spawning backend process");

        let mut command = Command::new(&plan.command);
        command.args(&plan.args);
        for (key, value) in &plan.env {
            command.env(key, value);
        }
        if let Some(dir) = &plan.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", plan.command.display(), e)))?;
        let pid = child.id();

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) => tracing::info!(target: "backend", backend_id = %id, "[Backend] {}", line),
                        Err(_) => break,
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) => tracing::warn!(target: "backend", backend_id = %id, "[Backend Error] {}", line),
                        Err(_) => break,
                    }
                }
            }));
        }

        tracing::info!(backend_id = %id, pid, "Backend process spawned");
        Ok(Self {
            id,
            pid,
            child,
            log_tasks,
        })
    }

    /// Get the backend instance id.
    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Get the OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check whether the process has exited, without blocking.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_status()
            .map_err(|e| Error::Process(format!("Failed to poll backend exit status: {}", e)))
    }

    /// Terminate the process, gracefully first and forcefully if needed.
    ///
    /// Sends a graceful termination signal (where the platform supports
    /// one), then races the exit against `grace`. If the deadline fires
    /// first, escalates to a forceful kill. With `tree_kill` the escalation
    /// also kills descendant processes; without it only this process is
    /// killed, so a sibling updater spawned earlier survives.
    ///
    /// Always resolves; termination failures are logged, never surfaced.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(backend_id = %self.id, pid = self.pid))]
    pub async fn terminate(mut self, grace: Duration, tree_kill: bool) {
        let graceful_sent = terminate::send_graceful(self.pid);
        if graceful_sent {
            tracing::debug!("Sent graceful termination signal");
            if self.wait_for_exit(grace).await {
                self.finish().await;
                return;
            }
            tracing::warn!("Backend did not exit within grace period, escalating to kill");
        } else {
            tracing::debug!("No graceful termination available, killing directly");
        }

        if tree_kill {
            terminate::kill_descendants(self.pid);
        }
        if let Err(e) = self.child.kill() {
            tracing::warn!(error = %e, "Failed to kill backend process");
        }
        self.finish().await;
    }

    /// Poll for exit until `deadline` elapses. Returns `true` on exit.
    async fn wait_for_exit(&mut self, deadline: Duration) -> bool {
        let started = tokio::time::Instant::now();
        while started.elapsed() < deadline {
            match self.child.try_status() {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll backend exit status");
                    return false;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Reap the child and stop the log forwarders.
    async fn finish(mut self) {
        match self.child.status().await {
            Ok(status) => tracing::info!(%status, "Backend process terminated"),
            Err(e) => tracing::warn!(error = %e, "Failed to reap backend process"),
        }
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        // A discarded handle (crash recovery drops the dead instance without
        // teardown) must not leave forwarder tasks reading closed pipes.
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}
