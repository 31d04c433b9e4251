#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use studio_backend::{
    BackendConfig, BackendEvent, BackendManager, BackendStatus, BackendTunables, Error,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const MARKER_ENV: &str = "STUDIO_TEST_MARKER";

/// Write a fake dev interpreter into the server checkout. The manager
/// launches it like the real thing; the script records each launch in a
/// marker file and then idles like a server would.
fn install_fake_backend(root: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let bin = root.join("server").join(".venv").join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let interpreter = bin.join("python3");
    std::fs::write(&interpreter, body).unwrap();
    std::fs::set_permissions(&interpreter, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn idle_backend_script() -> String {
    format!(
        concat!(
            "#!/bin/sh\n",
            "if [ -n \"${marker}\" ]; then echo launch >> \"${marker}\"; fi\n",
            "exec sleep 300\n",
        ),
        marker = MARKER_ENV
    )
}

fn stubborn_backend_script() -> String {
    // Ignores the graceful termination signal; stop() has to escalate.
    "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n".to_string()
}

fn test_tunables() -> BackendTunables {
    BackendTunables {
        probe_interval: Duration::from_millis(50),
        ready_timeout: Duration::from_secs(3),
        ml_ready_timeout: Duration::from_millis(300),
        monitor_interval: Duration::from_millis(100),
        monitor_request_timeout: Duration::from_millis(300),
        recovery_backoff: Duration::from_millis(400),
        termination_grace: Duration::from_secs(1),
        max_restart_attempts: 3,
    }
}

struct Fixture {
    _dir: TempDir,
    manager: BackendManager,
    server: MockServer,
    marker: std::path::PathBuf,
}

async fn fixture_with_script(script: String) -> Fixture {
    let dir = TempDir::new().unwrap();
    install_fake_backend(dir.path(), &script);
    let marker = dir.path().join("launches.log");

    let server = MockServer::start_async().await;
    let mut config = BackendConfig::new(
        dir.path().join("data"),
        dir.path().join("resources"),
        dir.path().join("server"),
    );
    config.dev_mode = true;
    config.fixed_port = Some(server.port());
    config.tunables = test_tunables();
    config
        .extra_env
        .insert(MARKER_ENV.to_string(), marker.display().to_string());

    let manager = BackendManager::new(config).unwrap();
    Fixture {
        _dir: dir,
        manager,
        server,
        marker,
    }
}

async fn fixture() -> Fixture {
    fixture_with_script(idle_backend_script()).await
}

impl Fixture {
    async fn healthy_mock(&self) -> httpmock::Mock<'_> {
        self.server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200)
                    .json_body(json!({"core_ready": true, "ml_ready": false}));
            })
            .await
    }

    fn launch_count(&self) -> usize {
        std::fs::read_to_string(&self.marker)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

/// Drain events until `want` shows up or `timeout` elapses.
async fn wait_for_status(
    events: &mut broadcast::Receiver<BackendEvent>,
    want: BackendStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(BackendEvent::StatusChanged(info))) if info.status == want => return true,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn test_start_reaches_running_quickly() {
    let fx = fixture().await;
    fx.healthy_mock().await;

    let started = tokio::time::Instant::now();
    let port = fx.manager.start().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(port, fx.server.port());

    let info = fx.manager.info();
    assert_eq!(info.status, BackendStatus::Running);
    assert_eq!(info.url, format!("http://127.0.0.1:{}", port));
    assert_eq!(info.restart_count, 0);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_second_start_is_single_flight() {
    let fx = fixture().await;
    fx.healthy_mock().await;

    let first = fx.manager.start().await.unwrap();
    let second = fx.manager.start().await.unwrap();

    assert_eq!(first, second);
    // Exactly one process was ever launched.
    assert_eq!(fx.launch_count(), 1);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_start_non_blocking_reports_through_events() {
    let fx = fixture().await;
    fx.healthy_mock().await;

    let mut events = fx.manager.subscribe();
    let port = fx.manager.start_non_blocking().await.unwrap();
    assert_eq!(port, fx.server.port());

    assert!(wait_for_status(&mut events, BackendStatus::Running, Duration::from_secs(3)).await);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_start_failure_surfaces_health_timeout() {
    let fx = fixture().await;
    // No health mock: every probe attempt 404s until the ceiling.

    let result = fx.manager.start().await;

    assert!(matches!(result, Err(Error::HealthCheckTimeout(_))));
    assert_eq!(fx.manager.info().status, BackendStatus::Error);
}

#[tokio::test]
async fn test_setup_required_when_nothing_to_launch() {
    let dir = TempDir::new().unwrap();
    // No dev interpreter, no provisioned runtime, no standalone executable.
    let config = BackendConfig::new(
        dir.path().join("data"),
        dir.path().join("resources"),
        dir.path().join("server"),
    );
    let manager = BackendManager::new(config).unwrap();

    let result = manager.start().await;

    assert!(matches!(result, Err(Error::SetupRequired)));
    assert_eq!(manager.info().status, BackendStatus::SetupRequired);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fx = fixture().await;
    fx.healthy_mock().await;

    fx.manager.start().await.unwrap();
    fx.manager.stop().await;
    assert_eq!(fx.manager.info().status, BackendStatus::Stopped);

    // Stopping again, and stopping something never started, are no-ops.
    fx.manager.stop().await;
    assert_eq!(fx.manager.info().status, BackendStatus::Stopped);
}

#[tokio::test]
async fn test_stop_escalates_on_stubborn_process() {
    let fx = fixture_with_script(stubborn_backend_script()).await;
    fx.healthy_mock().await;

    fx.manager.start().await.unwrap();

    let started = tokio::time::Instant::now();
    fx.manager.stop().await;

    // Graceful signal is ignored; stop still resolves shortly after the
    // grace period by escalating to a kill.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4));
    assert_eq!(fx.manager.info().status, BackendStatus::Stopped);
}

#[tokio::test]
async fn test_deliberate_stop_never_triggers_recovery() {
    let fx = fixture().await;
    fx.healthy_mock().await;

    fx.manager.start().await.unwrap();
    let mut events = fx.manager.subscribe();
    fx.manager.stop().await;

    // Give the exit watcher and monitor time to misbehave if they were
    // going to.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut saw_recovery = false;
    while let Ok(event) = events.try_recv() {
        if let BackendEvent::StatusChanged(info) = event {
            if matches!(info.status, BackendStatus::Restarting | BackendStatus::Error) {
                saw_recovery = true;
            }
        }
    }
    assert!(!saw_recovery);
    assert_eq!(fx.launch_count(), 1);
}

#[tokio::test]
async fn test_crash_recovery_restores_running() {
    let fx = fixture().await;
    let mut healthy = fx.healthy_mock().await;

    fx.manager.start().await.unwrap();
    let mut events = fx.manager.subscribe();

    // Health endpoint goes dark; the monitor notices and recovery begins.
    healthy.delete_async().await;
    assert!(wait_for_status(&mut events, BackendStatus::Restarting, Duration::from_secs(3)).await);

    // Endpoint comes back before the recovery probe gives up.
    fx.healthy_mock().await;
    assert!(wait_for_status(&mut events, BackendStatus::Running, Duration::from_secs(5)).await);

    let info = fx.manager.info();
    assert_eq!(info.restart_count, 1);
    assert_eq!(fx.launch_count(), 2);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_recovery_ceiling_settles_to_error() {
    let fx = fixture().await;
    let mut healthy = fx.healthy_mock().await;

    fx.manager.start().await.unwrap();
    let mut events = fx.manager.subscribe();

    // Three failure/recovery cycles exhaust the ceiling.
    for _ in 0..3 {
        healthy.delete_async().await;
        assert!(
            wait_for_status(&mut events, BackendStatus::Restarting, Duration::from_secs(3)).await
        );
        healthy = fx.healthy_mock().await;
        assert!(wait_for_status(&mut events, BackendStatus::Running, Duration::from_secs(5)).await);
    }
    assert_eq!(fx.manager.info().restart_count, 3);

    // The fourth failure is observed but produces no further attempt.
    healthy.delete_async().await;
    assert!(wait_for_status(&mut events, BackendStatus::Error, Duration::from_secs(3)).await);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let info = fx.manager.info();
    assert_eq!(info.status, BackendStatus::Error);
    assert_eq!(info.restart_count, 3);
    // 1 initial launch + 3 recoveries, no 4th respawn.
    assert_eq!(fx.launch_count(), 4);
}

#[tokio::test]
async fn test_explicit_restart_resets_counter() {
    let fx = fixture().await;
    let mut healthy = fx.healthy_mock().await;

    fx.manager.start().await.unwrap();
    let mut events = fx.manager.subscribe();

    // One automatic recovery first.
    healthy.delete_async().await;
    assert!(wait_for_status(&mut events, BackendStatus::Restarting, Duration::from_secs(3)).await);
    fx.healthy_mock().await;
    assert!(wait_for_status(&mut events, BackendStatus::Running, Duration::from_secs(5)).await);
    assert_eq!(fx.manager.info().restart_count, 1);

    let port = fx.manager.restart().await.unwrap();

    assert_eq!(port, fx.server.port());
    let info = fx.manager.info();
    assert_eq!(info.status, BackendStatus::Running);
    assert_eq!(info.restart_count, 0);

    fx.manager.stop().await;
}

#[tokio::test]
async fn test_ml_readiness_timeout_is_reported_not_thrown() {
    let fx = fixture().await;
    fx.healthy_mock().await;
    // No /readiness mock; the poll 404s until its short test ceiling.

    let mut events = fx.manager.subscribe();
    fx.manager.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut outcome = None;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(BackendEvent::MlReadiness { ready, error })) => {
                outcome = Some((ready, error));
                break;
            }
            Ok(Ok(_)) => {}
            _ => {}
        }
    }

    let (ready, error) = outcome.expect("no ML readiness event received");
    assert!(!ready);
    assert!(error.is_some());
    // The backend itself stays healthy throughout.
    assert_eq!(fx.manager.info().status, BackendStatus::Running);

    fx.manager.stop().await;
}
