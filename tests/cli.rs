//! End-to-end CLI tests: invoke the built `testledger` binary against a real
//! shell command and assert on its exit code and the report tree it leaves
//! behind under `.3pio/`.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn testledger_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("testledger"))
}

#[test]
fn mirrors_a_successful_command_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    testledger_cmd()
        .current_dir(dir.path())
        .args(["sh", "-c", "exit 0"])
        .assert()
        .success();
}

#[test]
fn mirrors_a_failing_command_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    testledger_cmd()
        .current_dir(dir.path())
        .args(["sh", "-c", "exit 3"])
        .assert()
        .code(3);
}

#[test]
fn unstartable_command_exits_with_the_startup_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    testledger_cmd()
        .current_dir(dir.path())
        .args(["this-binary-does-not-exist-anywhere"])
        .assert()
        .code(127);
}

#[test]
fn writes_a_test_run_report_under_dot_3pio() {
    let dir = tempfile::tempdir().unwrap();
    testledger_cmd()
        .current_dir(dir.path())
        .args(["true"])
        .assert()
        .success();

    let runs_dir = dir.path().join(".3pio").join("runs");
    let run_dir = std::fs::read_dir(&runs_dir)
        .expect("runs directory should exist")
        .next()
        .expect("one run directory should have been created")
        .unwrap()
        .path();
    assert!(run_dir.join("test-run.md").exists());
    assert!(run_dir.join("output.log").exists());
}

#[test]
fn prints_the_greeting_with_the_command_line() {
    let dir = tempfile::tempdir().unwrap();
    testledger_cmd()
        .current_dir(dir.path())
        .args(["true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("I will now execute the test command"));
}

#[test]
fn requires_a_trailing_command() {
    let dir = tempfile::tempdir().unwrap();
    testledger_cmd().current_dir(dir.path()).assert().failure();
}
