//! Managed runtime module for the Studio backend runner.
//!
//! Packaged installs of the Studio shell do not ship a language runtime for
//! the analysis server; one is provisioned into the per-user data directory
//! on first launch. This module owns the runtime descriptor, filesystem
//! probing at startup, validation of user-supplied environments, and the
//! provisioning state machine itself.
//!
//! # Components
//!
//! * `provision` - Download, extraction, environment creation and package
//!   installation with fine-grained progress reporting

pub mod provision;

pub use provision::{ProvisionConfig, RuntimeProvisioner, SetupPhase};

use crate::config::{env_interpreter, Settings};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory under the data root holding the extracted base runtime.
pub(crate) const RUNTIME_DIR: &str = "runtime";
/// Directory under the data root holding the isolated environment.
pub(crate) const ENV_DIR: &str = "env";
/// Diagnostics record written after a successful provisioning.
pub(crate) const BUILD_INFO_FILE: &str = "build_info.json";

/// Minimum interpreter version accepted for user-supplied environments.
pub const MIN_PYTHON_VERSION: (u32, u32) = (3, 10);

/// Package whose importability marks an environment as carrying the
/// analysis engine. The check is best-effort.
pub const ENGINE_PACKAGE: &str = "studio_analysis";

/// Phase of the managed runtime lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// No runtime provisioned yet.
    None,
    /// Downloading the runtime archive.
    Downloading,
    /// Extracting the archive.
    Extracting,
    /// Creating the isolated environment.
    CreatingEnv,
    /// Installing required packages.
    Installing,
    /// Runtime is usable.
    Ready,
    /// A provisioning step failed.
    Error,
}

/// Descriptor of the managed runtime environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    /// Current lifecycle phase.
    pub status: RuntimeStatus,
    /// Root of the isolated environment.
    pub env_dir: PathBuf,
    /// Interpreter inside the environment, once known.
    pub interpreter: Option<PathBuf>,
    /// Whether the environment was supplied by the user rather than
    /// provisioned.
    pub is_custom: bool,
    /// Message of the failure that put the runtime into the error state.
    pub error: Option<String>,
}

impl EnvironmentInfo {
    fn absent(env_dir: PathBuf) -> Self {
        Self {
            status: RuntimeStatus::None,
            env_dir,
            interpreter: None,
            is_custom: false,
            error: None,
        }
    }

    fn ready(env_dir: PathBuf, interpreter: PathBuf, is_custom: bool) -> Self {
        Self {
            status: RuntimeStatus::Ready,
            env_dir,
            interpreter: Some(interpreter),
            is_custom,
            error: None,
        }
    }
}

/// Rebuild the environment descriptor from the filesystem.
///
/// A custom environment recorded in the settings wins over a provisioned
/// one; either is `Ready` when its interpreter still exists, otherwise the
/// descriptor degrades to `None` so the shell can route the user to setup.
///
/// This function is instrumented with `tracing`.
#[tracing::instrument(skip(settings), fields(data_dir = %data_dir.display()))]
pub fn probe_environment(data_dir: &Path, settings: &Settings) -> EnvironmentInfo {
    if let Some(custom) = &settings.custom_env_path {
        let interpreter = env_interpreter(custom);
        if interpreter.exists() {
            tracing::info!(env = %custom.display(), "Using custom environment from settings");
            return EnvironmentInfo::ready(custom.clone(), interpreter, true);
        }
        tracing::warn!(
            env = %custom.display(),
            "Custom environment from settings no longer exists, ignoring"
        );
    }

    let env_dir = data_dir.join(ENV_DIR);
    let interpreter = env_interpreter(&env_dir);
    if interpreter.exists() {
        tracing::info!(env = %env_dir.display(), "Found provisioned environment");
        return EnvironmentInfo::ready(env_dir, interpreter, false);
    }
    tracing::debug!("No managed environment present");
    EnvironmentInfo::absent(env_dir)
}

/// Validate a user-supplied environment rooted at `path`.
///
/// Checks that the interpreter exists and meets the minimum version, and
/// probes for the analysis engine package without failing when it is
/// absent. Returns the descriptor to adopt.
///
/// This function is instrumented with `tracing`.
#[tracing::instrument(fields(path = %path.display()))]
pub async fn validate_existing_environment(path: &Path) -> Result<EnvironmentInfo> {
    let interpreter = env_interpreter(path);
    if !interpreter.exists() {
        return Err(Error::InvalidEnvironment(format!(
            "No interpreter found at {}",
            interpreter.display()
        )));
    }

    let version = interpreter_version(&interpreter).await?;
    if let Some((major, minor)) = parse_python_version(&version) {
        if (major, minor) < MIN_PYTHON_VERSION {
            return Err(Error::InvalidEnvironment(format!(
                "Interpreter reports {}, minimum supported is {}.{}",
                version.trim(),
                MIN_PYTHON_VERSION.0,
                MIN_PYTHON_VERSION.1
            )));
        }
    } else {
        return Err(Error::InvalidEnvironment(format!(
            "Could not parse interpreter version from {:?}",
            version.trim()
        )));
    }

    match engine_importable(&interpreter).await {
        true => tracing::info!("Analysis engine package found in custom environment"),
        false => tracing::warn!(
            package = ENGINE_PACKAGE,
            "Analysis engine package not importable in custom environment"
        ),
    }

    Ok(EnvironmentInfo::ready(
        path.to_path_buf(),
        interpreter,
        true,
    ))
}

/// Run `<interpreter> --version` and capture the combined output.
pub(crate) async fn interpreter_version(interpreter: &Path) -> Result<String> {
    let output = async_process::Command::new(interpreter)
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            Error::InvalidEnvironment(format!(
                "Failed to run {}: {}",
                interpreter.display(),
                e
            ))
        })?;
    // Python 2 printed the banner to stderr; accept either stream.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = if stdout.trim().is_empty() {
        stderr.into_owned()
    } else {
        stdout.into_owned()
    };
    Ok(combined)
}

/// Parse `"Python 3.11.4"` into `(3, 11)`.
pub(crate) fn parse_python_version(banner: &str) -> Option<(u32, u32)> {
    let numbers = banner.trim().strip_prefix("Python")?.trim();
    let mut parts = numbers.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

async fn engine_importable(interpreter: &Path) -> bool {
    async_process::Command::new(interpreter)
        .args(["-c", &format!("import {}", ENGINE_PACKAGE)])
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Diagnostics record persisted after a successful provisioning.
///
/// Written for support bundles; never read back into logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Interpreter version banner.
    pub python_version: String,
    /// OS / architecture tag of the host that provisioned the runtime.
    pub platform: String,
    /// Unix timestamp of when provisioning completed.
    pub created_at: u64,
}

impl BuildInfo {
    pub(crate) fn current(python_version: String) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            python_version,
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            created_at,
        }
    }

    pub(crate) fn write(&self, data_dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode build info: {}", e)))?;
        std::fs::write(data_dir.join(BUILD_INFO_FILE), raw)
            .map_err(|e| Error::Provision(format!("Failed to write build info: {}", e)))
    }
}
