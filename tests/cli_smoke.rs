//! Behavioural smoke tests for the CLI entrypoint.
//!
//! None of these reach the container runtime: they exercise argument
//! parsing, request validation and the paths that fail before any service
//! is contacted.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn isolated(tmp: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("simrelay");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env("XDG_CONFIG_HOME", tmp.path())
        .env("SIMRELAY_STATE_DIR", tmp.path().join("state"))
        .env("SIMRELAY_DOCKER_BIN", "/nonexistent/docker")
        .env_remove("SIMRELAY_CONFIG_PATH");
    cmd
}

fn tempdir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("simrelay");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn querying_an_unknown_task_reports_failure() {
    let tmp = tempdir();
    let output = isolated(&tmp)
        .args(["query", "no-such-task"])
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();

    let report: Value = serde_json::from_slice(&output).expect("report is JSON");
    assert_eq!(report.get("status").and_then(Value::as_str), Some("failed"));
    assert_eq!(
        report.get("task_id").and_then(Value::as_str),
        Some("no-such-task")
    );
    assert!(
        report
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("unknown task")),
        "{report}"
    );
}

#[test]
fn cleaning_up_an_unknown_task_is_a_no_op() {
    let tmp = tempdir();
    isolated(&tmp)
        .args(["cleanup", "no-such-task"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"record_removed\": false"));
}

#[test]
fn missing_request_file_is_rejected() {
    let tmp = tempdir();
    isolated(&tmp)
        .args(["submit", "absent.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid request absent.json"));
}

#[test]
fn request_with_missing_workdir_is_rejected_before_submission() {
    let tmp = tempdir();
    let request = tmp.path().join("request.json");
    std::fs::write(
        &request,
        r#"{"workdir": "/definitely/not/here", "inputs": {"ligand_file": {"path": "/in/l.pdb", "content": "x"}}}"#,
    )
    .expect("write request");

    isolated(&tmp)
        .arg("submit-async")
        .arg(&request)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("workdir does not exist"));
}

#[test]
fn malformed_request_is_rejected() {
    let tmp = tempdir();
    let request = tmp.path().join("request.json");
    std::fs::write(&request, "{\"inputs\": 3}").expect("write request");

    isolated(&tmp)
        .arg("submit")
        .arg(&request)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid request"));
}
