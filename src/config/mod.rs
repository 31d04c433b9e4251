//! Configuration module for the Studio backend runner.
//!
//! This module holds the launch configuration handed to [`crate::BackendManager`]
//! by the embedding desktop shell, the supervision tunables (poll intervals,
//! timeouts, retry ceiling), and the small persisted settings record that
//! outlives the process.
//!
//! # Examples
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use studio_backend::config::BackendConfig;
//!
//! let config = BackendConfig::new(
//!     "/home/user/.local/share/studio",
//!     "/opt/studio/resources",
//!     "/home/user/src/studio-server",
//! );
//! assert!(config.fixed_port.is_none());
//! ```
mod settings;

pub use settings::Settings;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Python module invoked with `-m` when launching the server from an interpreter.
pub const SERVER_MODULE: &str = "studio_server";

/// File name of the standalone packaged server executable.
#[cfg(windows)]
pub const STANDALONE_EXECUTABLE: &str = "studio-server.exe";
/// File name of the standalone packaged server executable.
#[cfg(not(windows))]
pub const STANDALONE_EXECUTABLE: &str = "studio-server";

/// Environment variable carrying the allocated port to the child.
pub const ENV_PORT: &str = "STUDIO_BACKEND_PORT";
/// Environment variable marking the server as desktop-embedded.
pub const ENV_DESKTOP_MODE: &str = "STUDIO_DESKTOP_MODE";
/// Environment variable identifying the enclosing shell to the server.
pub const ENV_LAUNCHED_BY: &str = "STUDIO_LAUNCHED_BY";
/// Environment variable carrying the expected interpreter path for
/// the server's own self-diagnostics.
pub const ENV_INTERPRETER: &str = "STUDIO_PYTHON";

/// Supervision tunables for the backend manager.
///
/// The defaults are the production values; an embedding shell can tighten
/// them (the integration test suite does) without touching the state machine.
#[derive(Debug, Clone)]
pub struct BackendTunables {
    /// Delay between readiness probe attempts.
    pub probe_interval: Duration,
    /// Ceiling for the blocking readiness probe during `start()`.
    pub ready_timeout: Duration,
    /// Ceiling for the background ML-readiness poll.
    pub ml_ready_timeout: Duration,
    /// Delay between periodic health checks while running.
    pub monitor_interval: Duration,
    /// Per-request timeout for periodic health checks.
    pub monitor_request_timeout: Duration,
    /// Pause before respawning during crash recovery.
    pub recovery_backoff: Duration,
    /// How long a graceful termination may take before escalating to a kill.
    pub termination_grace: Duration,
    /// Maximum automatic recovery attempts since the last explicit start.
    pub max_restart_attempts: u32,
}

impl Default for BackendTunables {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(30),
            ml_ready_timeout: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(10),
            monitor_request_timeout: Duration::from_secs(5),
            recovery_backoff: Duration::from_secs(2),
            termination_grace: Duration::from_secs(5),
            max_restart_attempts: 3,
        }
    }
}

/// Launch configuration for the backend manager.
///
/// All paths are provided by the embedding shell; the library performs no
/// platform-specific directory discovery of its own.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Per-user application data root. Holds the persisted settings record,
    /// the provisioned runtime, and the isolated environment.
    pub data_dir: PathBuf,
    /// Packaged resources directory. The standalone server executable, when
    /// bundled by the installer, lives here.
    pub resources_dir: PathBuf,
    /// Development checkout of the server sources. Used as the working
    /// directory for module invocations and to locate the dev interpreter.
    pub server_source_dir: PathBuf,
    /// Development signal: prefer the dev interpreter over anything else.
    pub dev_mode: bool,
    /// Override: ignore any provisioned runtime and use the dev interpreter.
    pub force_system_env: bool,
    /// Pin the server to a fixed port instead of allocating an ephemeral one.
    pub fixed_port: Option<u16>,
    /// Extra environment variables forwarded to the spawned server, e.g.
    /// installer-specific portability markers.
    pub extra_env: HashMap<String, String>,
    /// Supervision tunables.
    pub tunables: BackendTunables,
}

impl BackendConfig {
    /// Create a configuration with default tunables.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        resources_dir: impl Into<PathBuf>,
        server_source_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            resources_dir: resources_dir.into(),
            server_source_dir: server_source_dir.into(),
            dev_mode: false,
            force_system_env: false,
            fixed_port: None,
            extra_env: HashMap::new(),
            tunables: BackendTunables::default(),
        }
    }

    /// Path of the development interpreter inside the server checkout.
    pub fn dev_interpreter(&self) -> PathBuf {
        self.server_source_dir.join(".venv").join(interpreter_rel())
    }

    /// Path of the standalone packaged server executable.
    pub fn standalone_executable(&self) -> PathBuf {
        self.resources_dir.join(STANDALONE_EXECUTABLE)
    }
}

/// Interpreter location relative to an environment root.
pub(crate) fn interpreter_rel() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from("Scripts").join("python.exe")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("bin").join("python3")
    }
}

/// Interpreter path inside an environment rooted at `env_dir`.
pub(crate) fn env_interpreter(env_dir: &Path) -> PathBuf {
    env_dir.join(interpreter_rel())
}
