use std::path::{Path, PathBuf};

use studio_backend::config::{BackendConfig, ENV_INTERPRETER, ENV_PORT, STANDALONE_EXECUTABLE};
use studio_backend::server::locator::{resolve, LaunchSource};
use studio_backend::{EnvironmentInfo, RuntimeStatus};
use tempfile::TempDir;

fn config_in(root: &Path) -> BackendConfig {
    BackendConfig::new(
        root.join("data"),
        root.join("resources"),
        root.join("server"),
    )
}

fn absent_environment(config: &BackendConfig) -> EnvironmentInfo {
    EnvironmentInfo {
        status: RuntimeStatus::None,
        env_dir: config.data_dir.join("env"),
        interpreter: None,
        is_custom: false,
        error: None,
    }
}

fn ready_environment(env_dir: PathBuf, interpreter: PathBuf) -> EnvironmentInfo {
    EnvironmentInfo {
        status: RuntimeStatus::Ready,
        env_dir,
        interpreter: Some(interpreter),
        is_custom: false,
        error: None,
    }
}

#[test]
fn test_dev_mode_wins_over_everything() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(dir.path());
    config.dev_mode = true;

    let plan = resolve(&config, &absent_environment(&config), 4242);

    assert_eq!(plan.source, LaunchSource::DevInterpreter);
    assert_eq!(plan.command, config.dev_interpreter());
    assert_eq!(plan.working_dir.as_deref(), Some(config.server_source_dir.as_path()));
    // Module invocation with host and port.
    assert!(plan.args.contains(&"-m".to_string()));
    assert!(plan.args.contains(&"127.0.0.1".to_string()));
    assert!(plan.args.contains(&"4242".to_string()));
    assert_eq!(plan.env.get(ENV_PORT).map(String::as_str), Some("4242"));
}

#[test]
fn test_force_system_env_ignores_ready_runtime() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(dir.path());
    config.force_system_env = true;

    let env_dir = dir.path().join("data").join("env");
    let interpreter = env_dir.join("bin").join("python3");
    let environment = ready_environment(env_dir, interpreter);

    let plan = resolve(&config, &environment, 9000);

    assert_eq!(plan.source, LaunchSource::DevInterpreter);
}

#[test]
fn test_ready_runtime_is_used_when_present() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());

    // The locator checks the interpreter actually exists on disk.
    let env_dir = dir.path().join("data").join("env");
    let bin = env_dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let interpreter = bin.join("python3");
    std::fs::write(&interpreter, b"").unwrap();

    let environment = ready_environment(env_dir, interpreter.clone());
    let plan = resolve(&config, &environment, 8100);

    assert_eq!(plan.source, LaunchSource::ManagedRuntime);
    assert_eq!(plan.command, interpreter);
    assert_eq!(
        plan.env.get(ENV_INTERPRETER).map(String::as_str),
        Some(interpreter.display().to_string().as_str())
    );
}

#[test]
fn test_standalone_executable_when_no_runtime() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());

    std::fs::create_dir_all(&config.resources_dir).unwrap();
    let executable = config.resources_dir.join(STANDALONE_EXECUTABLE);
    std::fs::write(&executable, b"").unwrap();

    let plan = resolve(&config, &absent_environment(&config), 8200);

    assert_eq!(plan.source, LaunchSource::StandaloneExecutable);
    assert_eq!(plan.command, executable);
    // Direct invocation takes only the port, no module or host flags.
    assert_eq!(plan.args, vec!["--port".to_string(), "8200".to_string()]);
    assert!(plan.working_dir.is_none());
}

#[test]
fn test_fallback_to_dev_interpreter_when_standalone_missing() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());

    let plan = resolve(&config, &absent_environment(&config), 8300);

    assert_eq!(plan.source, LaunchSource::DevFallback);
    assert_eq!(plan.command, config.dev_interpreter());
}

#[test]
fn test_ready_runtime_with_missing_interpreter_degrades() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());

    // Marked ready but the interpreter vanished from disk.
    let env_dir = dir.path().join("data").join("env");
    let interpreter = env_dir.join("bin").join("python3");
    let environment = ready_environment(env_dir, interpreter);

    let plan = resolve(&config, &environment, 8400);

    assert_eq!(plan.source, LaunchSource::DevFallback);
}

#[test]
fn test_extra_env_is_forwarded() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(dir.path());
    config.dev_mode = true;
    config
        .extra_env
        .insert("STUDIO_PORTABLE".to_string(), "1".to_string());

    let plan = resolve(&config, &absent_environment(&config), 8500);

    assert_eq!(plan.env.get("STUDIO_PORTABLE").map(String::as_str), Some("1"));
}
