use super::{load_config_from, validate_config, Config, ProjectMode};
use crate::util::write_atomic;
use std::time::Duration;

#[test]
fn defaults_pass_validation() {
    let config = Config::default();
    validate_config(&config).expect("defaults valid");
    assert_eq!(config.default_project_mode, ProjectMode::Existing);
    assert_eq!(config.metadata_lock.poll, Duration::from_millis(50));
}

#[test]
fn file_overrides_merge_over_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("reqflow.config.json");
    write_atomic(
        &path,
        r#"{
            "spec_dir": "requirements",
            "default_project_mode": "greenfield",
            "requirement_lock_timeout_sec": 0.5
        }"#,
    )
    .expect("write config");

    let config = load_config_from(&path).expect("load");
    assert_eq!(config.spec_dir, std::path::PathBuf::from("requirements"));
    assert_eq!(config.default_project_mode, ProjectMode::Greenfield);
    assert_eq!(config.requirement_lock.timeout, Duration::from_millis(500));
    // Untouched knobs keep their defaults.
    assert_eq!(config.metadata_lock.timeout, Duration::from_millis(8_000));
}

#[test]
fn non_positive_lock_timing_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("reqflow.config.json");
    write_atomic(&path, r#"{"metadata_lock_poll_sec": 0}"#).expect("write config");
    let err = load_config_from(&path).expect_err("zero poll rejected");
    assert!(err.to_string().contains("metadata_lock_poll_sec"));
}

#[test]
fn unknown_project_mode_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("reqflow.config.json");
    write_atomic(&path, r#"{"default_project_mode": "brownfield"}"#).expect("write config");
    assert!(load_config_from(&path).is_err());
}
