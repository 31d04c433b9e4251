//! Launch command resolution.
//!
//! Decides which executable starts the backend for the current
//! installation: a development interpreter, a provisioned managed runtime,
//! or the standalone packaged executable. Pure decision logic; the only
//! side effects are filesystem existence checks.

use crate::config::{
    BackendConfig, ENV_DESKTOP_MODE, ENV_INTERPRETER, ENV_LAUNCHED_BY, ENV_PORT, SERVER_MODULE,
};
use crate::runtime::{EnvironmentInfo, RuntimeStatus};
use std::collections::HashMap;
use std::path::PathBuf;

/// Which branch of the resolution order produced a [`LaunchPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchSource {
    /// Development interpreter from the server checkout.
    DevInterpreter,
    /// Interpreter of a provisioned (or user-supplied) managed runtime.
    ManagedRuntime,
    /// Standalone packaged executable from the resources directory.
    StandaloneExecutable,
    /// Development interpreter used as a last resort because the expected
    /// standalone executable was missing.
    DevFallback,
}

/// Fully resolved command line for launching the backend.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Executable to spawn.
    pub command: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for the spawned process, when it matters.
    pub working_dir: Option<PathBuf>,
    /// Environment variables set on the spawned process, combined with the
    /// parent environment.
    pub env: HashMap<String, String>,
    /// Which resolution branch produced this plan.
    pub source: LaunchSource,
}

/// Resolve the launch plan for the backend on `port`.
///
/// Decision order:
/// 1. Development mode or a forced system environment uses the dev
///    interpreter with a module invocation.
/// 2. A ready managed runtime uses its interpreter with the same module
///    invocation, working directory set to the server sources.
/// 3. A packaged standalone executable is launched directly.
/// 4. Last resort: the dev interpreter again, logging that the standalone
///    binary was expected but missing.
///
/// Never fails; the returned plan may still fail to spawn.
///
/// This function is instrumented with `tracing`.
#[tracing::instrument(skip(config, environment))]
pub fn resolve(config: &BackendConfig, environment: &EnvironmentInfo, port: u16) -> LaunchPlan {
    let env = base_env(config, port);

    if config.dev_mode || config.force_system_env {
        let interpreter = config.dev_interpreter();
        tracing::debug!(interpreter = %interpreter.display(), "Using development interpreter");
        return module_plan(interpreter, config, port, env, LaunchSource::DevInterpreter);
    }

    if environment.status == RuntimeStatus::Ready {
        if let Some(interpreter) = environment.interpreter.clone() {
            if interpreter.exists() {
                tracing::debug!(interpreter = %interpreter.display(), "Using managed runtime");
                let mut env = env;
                env.insert(
                    ENV_INTERPRETER.to_string(),
                    interpreter.display().to_string(),
                );
                return module_plan(interpreter, config, port, env, LaunchSource::ManagedRuntime);
            }
            tracing::warn!(
                interpreter = %interpreter.display(),
                "Managed runtime marked ready but interpreter is missing"
            );
        }
    }

    let standalone = config.standalone_executable();
    if standalone.exists() {
        tracing::debug!(executable = %standalone.display(), "Using standalone executable");
        return LaunchPlan {
            command: standalone,
            args: vec!["--port".to_string(), port.to_string()],
            working_dir: None,
            env,
            source: LaunchSource::StandaloneExecutable,
        };
    }

    tracing::warn!(
        expected = %standalone.display(),
        "Standalone backend executable missing, falling back to development interpreter"
    );
    module_plan(
        config.dev_interpreter(),
        config,
        port,
        env,
        LaunchSource::DevFallback,
    )
}

fn module_plan(
    interpreter: PathBuf,
    config: &BackendConfig,
    port: u16,
    env: HashMap<String, String>,
    source: LaunchSource,
) -> LaunchPlan {
    LaunchPlan {
        command: interpreter,
        args: vec![
            "-m".to_string(),
            SERVER_MODULE.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ],
        working_dir: Some(config.server_source_dir.clone()),
        env,
        source,
    }
}

fn base_env(config: &BackendConfig, port: u16) -> HashMap<String, String> {
    let mut env = config.extra_env.clone();
    env.insert(ENV_PORT.to_string(), port.to_string());
    env.insert(ENV_DESKTOP_MODE.to_string(), "1".to_string());
    env.insert(ENV_LAUNCHED_BY.to_string(), "studio-backend".to_string());
    env
}
