use std::path::PathBuf;
use std::time::Duration;

use studio_backend::config::{BackendConfig, BackendTunables, Settings};
use tempfile::TempDir;

#[test]
fn test_settings_default_when_file_absent() {
    let dir = TempDir::new().unwrap();

    let settings = Settings::load(dir.path()).unwrap();

    assert!(settings.custom_env_path.is_none());
}

#[test]
fn test_settings_roundtrip() {
    let dir = TempDir::new().unwrap();

    let settings = Settings {
        custom_env_path: Some(PathBuf::from("/opt/conda/envs/analysis")),
    };
    settings.save(dir.path()).unwrap();

    let loaded = Settings::load(dir.path()).unwrap();
    assert_eq!(
        loaded.custom_env_path,
        Some(PathBuf::from("/opt/conda/envs/analysis"))
    );
}

#[test]
fn test_settings_save_creates_data_dir() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("studio").join("data");

    Settings::default().save(&nested).unwrap();

    assert!(nested.join("settings.json").exists());
}

#[test]
fn test_settings_reject_malformed_json() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();

    assert!(Settings::load(dir.path()).is_err());
}

#[test]
fn test_tunables_defaults_match_production_values() {
    let tunables = BackendTunables::default();

    assert_eq!(tunables.probe_interval, Duration::from_millis(500));
    assert_eq!(tunables.ready_timeout, Duration::from_secs(30));
    assert_eq!(tunables.ml_ready_timeout, Duration::from_secs(120));
    assert_eq!(tunables.monitor_interval, Duration::from_secs(10));
    assert_eq!(tunables.monitor_request_timeout, Duration::from_secs(5));
    assert_eq!(tunables.recovery_backoff, Duration::from_secs(2));
    assert_eq!(tunables.termination_grace, Duration::from_secs(5));
    assert_eq!(tunables.max_restart_attempts, 3);
}

#[test]
fn test_dev_interpreter_lives_in_server_checkout() {
    let config = BackendConfig::new("/data", "/resources", "/server");

    let interpreter = config.dev_interpreter();

    assert!(interpreter.starts_with("/server/.venv"));
}

#[test]
fn test_standalone_executable_lives_in_resources() {
    let config = BackendConfig::new("/data", "/resources", "/server");

    let executable = config.standalone_executable();

    assert!(executable.starts_with("/resources"));
}
