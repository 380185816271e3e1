//! End-to-end tests for the CLI argument and configuration surface.
//!
//! Cycles that would touch the network are out of scope here; these pin the
//! exit-code contract: 0 on success, 2 on argument/config errors, non-zero
//! on runtime failure.

use std::fs;
use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{NamedTempFile, tempdir};

fn cli() -> Command {
    Command::cargo_bin("gcs-release-monitor").expect("binary")
}

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("tempfile");
    file.write_all(yaml.as_bytes()).expect("write");
    file
}

const WEBHOOK_ONLY: &str = r#"
delivery_mode: webhook_only
gcs:
  bucket: releases
webhook:
  url: https://filter.example/hooks/release
  shared_secret: s3cr3t
chain:
  organization: acme
  repository: node
"#;

#[test]
fn missing_config_flag_is_a_usage_error() {
    cli()
        .arg("--once")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn unreadable_config_file_exits_2() {
    cli()
        .args(["--config", "/definitely/not/a/config.yaml", "--once"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("config validation failed"));
}

#[test]
fn invalid_config_exits_2_with_the_reason() {
    let config = write_config(&format!("{WEBHOOK_ONLY}poll_interval_seconds: 5\n"));
    cli()
        .args(["--config"])
        .arg(config.path())
        .arg("--once")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("poll_interval_seconds"));
}

#[test]
fn full_mode_without_nextcloud_exits_2() {
    let config = write_config(&WEBHOOK_ONLY.replace("delivery_mode: webhook_only\n", ""));
    cli()
        .args(["--config"])
        .arg(config.path())
        .arg("--once")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nextcloud"));
}

#[test]
fn dry_run_without_once_exits_2() {
    let config = write_config(WEBHOOK_ONLY);
    cli()
        .args(["--config"])
        .arg(config.path())
        .arg("--dry-run")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--dry-run requires --once"));
}

#[test]
fn invalid_log_level_exits_2() {
    let config = write_config(WEBHOOK_ONLY);
    cli()
        .args(["--config"])
        .arg(config.path())
        .args(["--once", "--log-level", "verbose"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid log level"));
}

#[test]
fn runtime_failure_is_nonzero_but_not_2() {
    // A credentials file that does not exist passes config validation but
    // fails source construction, which is a runtime error, not exit 2.
    let td = tempdir().expect("tempdir");
    let state_dir = td.path().join("state");
    let yaml = format!(
        "{}state_dir: {}\ntemp_dir: {}\n",
        WEBHOOK_ONLY.replace(
            "  bucket: releases\n",
            "  bucket: releases\n  credentials_file: /definitely/not/credentials.json\n",
        ),
        state_dir.display(),
        td.path().join("tmp").display()
    );
    let config = write_config(&yaml);

    let assert = cli()
        .args(["--config"])
        .arg(config.path())
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to initialize monitor"));
    let code = assert.get_output().status.code();
    assert_ne!(code, Some(2), "runtime failures must not reuse exit code 2");

    // Nothing may be persisted when the run fails before processing.
    assert!(!state_dir.join("state.json").exists());
    let _ = fs::remove_dir_all(td.path());
}
