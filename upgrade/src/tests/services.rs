use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use super::MockManager;
use crate::zinit::ServiceManager;

const TIMEOUT: Duration = Duration::from_millis(50);

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn stop_multiple_kills_what_does_not_exit() {
    let manager = MockManager::default();
    manager.run("flistd");
    manager.run("stubborn");
    manager.ignore_stop("stubborn");

    let started = Instant::now();
    manager
        .stop_multiple(TIMEOUT, &names(&["flistd", "stubborn", "unknown"]))
        .await
        .unwrap();

    assert!(started.elapsed() >= TIMEOUT, "killed before the deadline");
    assert_eq!(vec!["stop", "kill[SIGKILL]"], manager.calls_for("stubborn"));
    assert_eq!(vec!["stop"], manager.calls_for("flistd"));
}

#[tokio::test]
async fn stop_multiple_kills_when_status_fails() {
    let manager = MockManager::default();
    manager.run("flistd");
    manager.break_status("flistd");

    manager
        .stop_multiple(TIMEOUT, &names(&["flistd"]))
        .await
        .unwrap();

    assert_eq!(vec!["stop", "kill[SIGKILL]"], manager.calls_for("flistd"));
}

#[tokio::test]
async fn stop_wait_kills_after_timeout() {
    let manager = MockManager::default();
    manager.run("flistd");
    manager.ignore_stop("flistd");

    let started = Instant::now();
    manager.stop_wait(TIMEOUT, "flistd").await.unwrap();

    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(vec!["stop", "kill[SIGKILL]"], manager.calls_for("flistd"));
    assert!(manager.status("flistd").await.unwrap().state.exited());
}

#[tokio::test]
async fn stop_wait_returns_once_exited() {
    let manager = MockManager::default();
    manager.run("flistd");

    manager.stop_wait(Duration::from_secs(5), "flistd").await.unwrap();
    assert_eq!(vec!["stop"], manager.calls_for("flistd"));
}
