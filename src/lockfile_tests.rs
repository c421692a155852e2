use super::{acquire_lock, pid_running, process_start_signature};
use crate::config::LockTuning;
use crate::error::CoreError;
use std::time::Duration;

fn fast_tuning() -> LockTuning {
    LockTuning {
        timeout: Duration::from_millis(200),
        poll: Duration::from_millis(10),
        stale: Duration::from_millis(60_000),
    }
}

#[test]
fn acquire_creates_and_release_removes_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("resource.lock");
    let guard = acquire_lock(&lock_path, &fast_tuning(), "test").expect("acquire");
    assert!(lock_path.is_file());
    let raw = std::fs::read_to_string(&lock_path).expect("read marker");
    assert!(raw.contains(&std::process::id().to_string()));
    guard.release();
    assert!(!lock_path.exists());
}

#[test]
fn held_lock_blocks_second_acquire_until_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("resource.lock");
    let _guard = acquire_lock(&lock_path, &fast_tuning(), "test").expect("acquire");
    let err = acquire_lock(&lock_path, &fast_tuning(), "test").expect_err("second must time out");
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::LockTimeout { name, .. }) => assert_eq!(*name, "test"),
        other => panic!("expected LockTimeout, got {other:?}"),
    }
}

#[test]
fn live_owner_is_not_reclaimed_even_past_staleness() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("resource.lock");
    // Staleness threshold far below the marker age, owner (this process) alive.
    let tuning = LockTuning {
        timeout: Duration::from_millis(150),
        poll: Duration::from_millis(10),
        stale: Duration::from_millis(1),
    };
    let _guard = acquire_lock(&lock_path, &tuning, "test").expect("acquire");
    std::thread::sleep(Duration::from_millis(30));
    let err = acquire_lock(&lock_path, &tuning, "test").expect_err("must not steal live lock");
    assert!(matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::LockTimeout { .. })
    ));
    assert!(lock_path.is_file());
}

#[test]
fn dead_owner_marker_is_reclaimed_after_staleness() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("resource.lock");
    // A child that exits immediately gives us a dead pid.
    let child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let dead_pid = child.id();
    let mut child = child;
    child.wait().expect("reap child");
    std::fs::write(
        &lock_path,
        format!("{{\"pid\": {dead_pid}, \"start\": \"0\"}}"),
    )
    .expect("write marker");

    let tuning = LockTuning {
        timeout: Duration::from_millis(2_000),
        poll: Duration::from_millis(10),
        stale: Duration::from_millis(20),
    };
    std::thread::sleep(Duration::from_millis(40));
    let started = std::time::Instant::now();
    let guard = acquire_lock(&lock_path, &tuning, "test").expect("reclaim dead owner");
    // Reclaim happens on the first poll, well under the full timeout.
    assert!(started.elapsed() < Duration::from_millis(1_000));
    guard.release();
}

#[test]
fn release_of_foreign_lock_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("resource.lock");
    let foreign_pid = std::process::id() + 1;
    std::fs::write(
        &lock_path,
        format!("{{\"pid\": {foreign_pid}, \"start\": \"123\"}}"),
    )
    .expect("write marker");
    super::release_lock_file(&lock_path);
    assert!(lock_path.is_file(), "foreign marker must survive release");
}

#[test]
fn pid_probes_report_this_process() {
    let pid = std::process::id();
    assert!(pid_running(pid));
    let signature = process_start_signature(pid);
    assert!(signature.is_some_and(|sig| !sig.is_empty()));
}

#[test]
fn exited_process_is_not_running() {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap child");
    assert!(!pid_running(pid));
}
