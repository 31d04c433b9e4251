//! Runtime provisioning: download, extraction, environment creation and
//! package installation.
//!
//! First launch of a packaged Studio install finds no runtime for the
//! analysis server. Provisioning downloads a redistributable interpreter
//! archive, extracts it into the data directory, creates an isolated
//! environment rooted at the extracted interpreter and installs the fixed
//! set of server packages, reporting fine-grained progress throughout so
//! the shell can render a setup screen.
//!
//! Each step owns a disjoint band of the overall 0-100 progress scale:
//! download 0-40, extraction 40-55, environment creation 55-70, package
//! installation 70-95, finalization 95-100.

use crate::config::env_interpreter;
use crate::error::{Error, Result};
use crate::runtime::{interpreter_version, BuildInfo, EnvironmentInfo, RuntimeStatus, ENV_DIR, RUNTIME_DIR};
use futures::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Packages installed into the isolated environment, in order. The server
/// and the analysis engine come last so their dependencies resolve against
/// the pinned scientific stack.
pub const REQUIRED_PACKAGES: &[&str] = &[
    "fastapi",
    "uvicorn",
    "numpy",
    "pandas",
    "studio-analysis",
    "studio-server",
];

/// Archives smaller than this are treated as broken partial downloads
/// rather than reusable caches.
const MIN_ARCHIVE_BYTES: u64 = 10 * 1024 * 1024;

/// Provisioning step, reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    /// Downloading the runtime archive.
    Download,
    /// Extracting the archive.
    Extract,
    /// Creating the isolated environment.
    CreateEnv,
    /// Installing required packages.
    Install,
    /// Bytecode precompilation and build metadata.
    Finalize,
}

impl SetupPhase {
    pub(crate) fn runtime_status(self) -> RuntimeStatus {
        match self {
            SetupPhase::Download => RuntimeStatus::Downloading,
            SetupPhase::Extract => RuntimeStatus::Extracting,
            SetupPhase::CreateEnv => RuntimeStatus::CreatingEnv,
            SetupPhase::Install | SetupPhase::Finalize => RuntimeStatus::Installing,
        }
    }
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupPhase::Download => "download",
            SetupPhase::Extract => "extract",
            SetupPhase::CreateEnv => "create_env",
            SetupPhase::Install => "install",
            SetupPhase::Finalize => "finalize",
        };
        write!(f, "{}", name)
    }
}

/// Provisioning configuration.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Per-user application data root.
    pub data_dir: PathBuf,
    /// Override for the runtime archive URL; the platform default is used
    /// when unset. Mirrors and air-gapped installs point this elsewhere.
    pub download_url: Option<String>,
    /// Packages installed into the environment, in order.
    pub packages: Vec<String>,
    /// Minimum size for a cached archive to be reused.
    pub min_archive_bytes: u64,
}

impl ProvisionConfig {
    /// Configuration with platform defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            download_url: None,
            packages: REQUIRED_PACKAGES.iter().map(|p| p.to_string()).collect(),
            min_archive_bytes: MIN_ARCHIVE_BYTES,
        }
    }
}

/// Provisions the managed runtime.
pub struct RuntimeProvisioner {
    config: ProvisionConfig,
    client: reqwest::Client,
}

impl RuntimeProvisioner {
    /// Create a provisioner.
    pub fn new(config: ProvisionConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Archive file name the platform descriptor resolves to.
    pub fn archive_path(&self) -> PathBuf {
        let (_, file_name) = platform_descriptor();
        self.config.data_dir.join(file_name)
    }

    /// Run the full provisioning sequence.
    ///
    /// `on_progress` receives `(percent, phase, detail)` at fine
    /// granularity. Any step's failure propagates to the caller; the
    /// manager records it on the environment descriptor.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, on_progress))]
    pub async fn setup<F>(&self, on_progress: F) -> Result<EnvironmentInfo>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        std::fs::create_dir_all(&self.config.data_dir).map_err(|e| {
            Error::Provision(format!(
                "Failed to create {}: {}",
                self.config.data_dir.display(),
                e
            ))
        })?;

        let archive = self.download_archive(&on_progress).await?;
        let base_interpreter = self.extract_archive(&archive, &on_progress).await?;
        let env_dir = self.create_environment(&base_interpreter, &on_progress).await?;
        let interpreter = env_interpreter(&env_dir);
        self.install_packages(&interpreter, &on_progress).await?;
        self.finalize(&interpreter, &env_dir, &on_progress).await?;

        on_progress(100, SetupPhase::Finalize, "Runtime ready");
        tracing::info!(env = %env_dir.display(), "Runtime provisioning complete");
        Ok(EnvironmentInfo {
            status: RuntimeStatus::Ready,
            env_dir,
            interpreter: Some(interpreter),
            is_custom: false,
            error: None,
        })
    }

    /// Download the runtime archive, reusing a plausible cached copy.
    /// Progress band 0-40.
    async fn download_archive<F>(&self, on_progress: &F) -> Result<PathBuf>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        let (default_url, _) = platform_descriptor();
        let url = self
            .config
            .download_url
            .clone()
            .unwrap_or_else(|| default_url.to_string());
        let target = self.archive_path();

        if let Ok(meta) = std::fs::metadata(&target) {
            if meta.len() >= self.config.min_archive_bytes {
                tracing::info!(archive = %target.display(), "Reusing cached runtime archive");
                on_progress(40, SetupPhase::Download, "Using cached archive");
                return Ok(target);
            }
            tracing::warn!(
                archive = %target.display(),
                size = meta.len(),
                "Cached archive implausibly small, re-downloading"
            );
        }

        on_progress(0, SetupPhase::Download, "Downloading runtime");
        tracing::info!(%url, "Downloading runtime archive");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provision(format!("Runtime download failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Provision(format!(
                "Runtime download failed with status {}",
                response.status()
            )));
        }

        let total = response.content_length();
        let partial = target.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await.map_err(|e| {
            Error::Provision(format!("Failed to create {}: {}", partial.display(), e))
        })?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::Provision(format!("Runtime download failed: {}", e)))?;
            file.write_all(&chunk).await.map_err(|e| {
                Error::Provision(format!("Failed to write {}: {}", partial.display(), e))
            })?;
            downloaded += chunk.len() as u64;
            if let Some(total) = total {
                let pct = (downloaded.min(total) * 40 / total.max(1)) as u8;
                on_progress(pct, SetupPhase::Download, "Downloading runtime");
            }
        }
        file.flush().await.map_err(|e| {
            Error::Provision(format!("Failed to flush {}: {}", partial.display(), e))
        })?;
        drop(file);

        tokio::fs::rename(&partial, &target).await.map_err(|e| {
            Error::Provision(format!("Failed to move archive into place: {}", e))
        })?;
        on_progress(40, SetupPhase::Download, "Download complete");
        tracing::info!(bytes = downloaded, "Runtime archive downloaded");
        Ok(target)
    }

    /// Extract the archive into a fresh runtime directory.
    /// Progress band 40-55.
    async fn extract_archive<F>(&self, archive: &Path, on_progress: &F) -> Result<PathBuf>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        on_progress(40, SetupPhase::Extract, "Extracting runtime");
        let runtime_dir = self.config.data_dir.join(RUNTIME_DIR);
        if runtime_dir.exists() {
            tracing::debug!(dir = %runtime_dir.display(), "Removing stale runtime extraction");
            std::fs::remove_dir_all(&runtime_dir).map_err(|e| {
                Error::Provision(format!(
                    "Failed to remove stale {}: {}",
                    runtime_dir.display(),
                    e
                ))
            })?;
        }
        std::fs::create_dir_all(&runtime_dir).map_err(|e| {
            Error::Provision(format!("Failed to create {}: {}", runtime_dir.display(), e))
        })?;

        let archive = archive.to_path_buf();
        let dest = runtime_dir.clone();
        tokio::task::spawn_blocking(move || extract_into(&archive, &dest))
            .await
            .map_err(|e| Error::Provision(format!("Extraction task failed: {}", e)))??;

        let interpreter = base_interpreter(&runtime_dir);
        if !interpreter.exists() {
            return Err(Error::Provision(format!(
                "Extracted runtime has no interpreter at {}",
                interpreter.display()
            )));
        }
        on_progress(55, SetupPhase::Extract, "Extraction complete");
        tracing::info!(interpreter = %interpreter.display(), "Runtime extracted");
        Ok(interpreter)
    }

    /// Create the isolated environment without a package installer, then
    /// bootstrap the installer inside it. Progress band 55-70.
    async fn create_environment<F>(
        &self,
        base_interpreter: &Path,
        on_progress: &F,
    ) -> Result<PathBuf>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        let env_dir = self.config.data_dir.join(ENV_DIR);
        if env_dir.exists() {
            std::fs::remove_dir_all(&env_dir).map_err(|e| {
                Error::Provision(format!("Failed to remove stale {}: {}", env_dir.display(), e))
            })?;
        }

        on_progress(55, SetupPhase::CreateEnv, "Creating environment");
        // --without-pip keeps creation fast; pip is bootstrapped right after.
        run_step(
            base_interpreter,
            &[
                "-m",
                "venv",
                "--without-pip",
                &env_dir.display().to_string(),
            ],
            "environment creation",
        )
        .await?;

        let interpreter = env_interpreter(&env_dir);
        if !interpreter.exists() {
            return Err(Error::Provision(format!(
                "Environment has no interpreter at {}",
                interpreter.display()
            )));
        }
        on_progress(62, SetupPhase::CreateEnv, "Bootstrapping installer");

        run_step(
            &interpreter,
            &["-m", "ensurepip", "--upgrade"],
            "installer bootstrap",
        )
        .await?;
        on_progress(70, SetupPhase::CreateEnv, "Environment ready");
        tracing::info!(env = %env_dir.display(), "Isolated environment created");
        Ok(env_dir)
    }

    /// Install the required packages one at a time. Progress band 70-95.
    async fn install_packages<F>(&self, interpreter: &Path, on_progress: &F) -> Result<()>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        let count = self.config.packages.len().max(1) as u64;
        for (index, package) in self.config.packages.iter().enumerate() {
            let pct = 70 + (index as u64 * 25 / count) as u8;
            on_progress(pct, SetupPhase::Install, package);
            tracing::info!(%package, "Installing package");
            run_step(
                interpreter,
                &["-m", "pip", "install", "--no-input", package],
                &format!("installation of {}", package),
            )
            .await?;
        }
        on_progress(95, SetupPhase::Install, "Packages installed");
        Ok(())
    }

    /// Best-effort bytecode precompilation and build metadata.
    /// Progress band 95-100.
    async fn finalize<F>(&self, interpreter: &Path, env_dir: &Path, on_progress: &F) -> Result<()>
    where
        F: Fn(u8, SetupPhase, &str) + Send + Sync,
    {
        on_progress(95, SetupPhase::Finalize, "Precompiling bytecode");
        // Failure here only costs startup time on first import.
        if let Err(e) = run_step(
            interpreter,
            &["-m", "compileall", "-q", &env_dir.display().to_string()],
            "bytecode precompilation",
        )
        .await
        {
            tracing::warn!(error = %e, "Bytecode precompilation failed, continuing");
        }

        on_progress(98, SetupPhase::Finalize, "Recording build metadata");
        let version = interpreter_version(interpreter)
            .await
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        BuildInfo::current(version).write(&self.config.data_dir)?;
        Ok(())
    }
}

/// Run a provisioning subprocess step, failing with its stderr excerpt.
async fn run_step(command: &Path, args: &[&str], step: &str) -> Result<()> {
    let output = async_process::Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Provision(format!("Failed to run {}: {}", step, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<char> = stderr.chars().rev().take(400).collect();
        let excerpt: String = tail.into_iter().rev().collect();
        return Err(Error::Provision(format!(
            "{} failed with {}: {}",
            step,
            output.status,
            excerpt.trim()
        )));
    }
    Ok(())
}

/// Extract `archive` into `dest`, dispatching on the archive format.
fn extract_into(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = std::fs::File::open(archive)
        .map_err(|e| Error::Provision(format!("Failed to open {}: {}", archive.display(), e)))?;

    if name.ends_with(".zip") {
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| Error::Provision(format!("Failed to read archive: {}", e)))?;
        zip.extract(dest)
            .map_err(|e| Error::Provision(format!("Failed to extract archive: {}", e)))?;
    } else {
        let decoder = flate2::read::GzDecoder::new(file);
        tar::Archive::new(decoder)
            .unpack(dest)
            .map_err(|e| Error::Provision(format!("Failed to extract archive: {}", e)))?;
    }
    Ok(())
}

/// Interpreter location inside an extracted runtime directory.
fn base_interpreter(runtime_dir: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        runtime_dir.join("python").join("python.exe")
    }
    #[cfg(not(windows))]
    {
        runtime_dir.join("python").join("bin").join("python3")
    }
}

/// Platform-specific download descriptor: `(url, archive file name)`.
fn platform_descriptor() -> (&'static str, &'static str) {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        (
            "https://github.com/indygreg/python-build-standalone/releases/download/20240415/cpython-3.11.9+20240415-x86_64-unknown-linux-gnu-install_only.tar.gz",
            "cpython-3.11.9-x86_64-linux.tar.gz",
        )
    }
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        (
            "https://github.com/indygreg/python-build-standalone/releases/download/20240415/cpython-3.11.9+20240415-aarch64-unknown-linux-gnu-install_only.tar.gz",
            "cpython-3.11.9-aarch64-linux.tar.gz",
        )
    }
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        (
            "https://github.com/indygreg/python-build-standalone/releases/download/20240415/cpython-3.11.9+20240415-x86_64-apple-darwin-install_only.tar.gz",
            "cpython-3.11.9-x86_64-macos.tar.gz",
        )
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        (
            "https://github.com/indygreg/python-build-standalone/releases/download/20240415/cpython-3.11.9+20240415-aarch64-apple-darwin-install_only.tar.gz",
            "cpython-3.11.9-aarch64-macos.tar.gz",
        )
    }
    #[cfg(windows)]
    {
        (
            "https://github.com/indygreg/python-build-standalone/releases/download/20240415/cpython-3.11.9+20240415-x86_64-pc-windows-msvc-install_only.zip",
            "cpython-3.11.9-x86_64-windows.zip",
        )
    }
    #[cfg(not(any(
        all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
        all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
        windows
    )))]
    {
        (
            "https://github.com/indygreg/python-build-standalone/releases/download/20240415/cpython-3.11.9+20240415-x86_64-unknown-linux-gnu-install_only.tar.gz",
            "cpython-3.11.9.tar.gz",
        )
    }
}
