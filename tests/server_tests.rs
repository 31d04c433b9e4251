use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use studio_backend::server::{allocate_port, BackendProcess, LaunchPlan, LaunchSource};

fn plan_for(command: &str, args: &[&str]) -> LaunchPlan {
    LaunchPlan {
        command: PathBuf::from(command),
        args: args.iter().map(|a| a.to_string()).collect(),
        working_dir: None,
        env: HashMap::new(),
        source: LaunchSource::DevInterpreter,
    }
}

#[tokio::test]
async fn test_allocate_port_returns_usable_ports() {
    let first = allocate_port().await.unwrap();
    let second = allocate_port().await.unwrap();

    assert!(first > 0);
    assert!(second > 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_spawn_and_observe_exit() {
    let plan = plan_for("/bin/echo", &["hello"]);
    let mut process = BackendProcess::spawn(&plan).await.unwrap();

    assert!(process.pid() > 0);

    // echo exits almost immediately; poll until the exit is observable.
    let mut exited = false;
    for _ in 0..50 {
        if process.try_exit_status().unwrap().is_some() {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(exited, "echo process never reported an exit status");
}

#[tokio::test]
async fn test_spawn_missing_executable_fails() {
    let plan = plan_for("/nonexistent/studio-backend-test-binary", &[]);
    let result = BackendProcess::spawn(&plan).await;

    assert!(result.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_terminate_resolves_for_cooperative_process() {
    let plan = plan_for("/bin/sleep", &["30"]);
    let process = BackendProcess::spawn(&plan).await.unwrap();

    let started = tokio::time::Instant::now();
    process.terminate(Duration::from_secs(2), true).await;

    // A cooperative process dies on the graceful signal, well inside grace.
    assert!(started.elapsed() < Duration::from_secs(2));
}
