//! CLI contract tests: help output, usage errors, and client behavior
//! without a running server.

use assert_cmd::Command;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("mu").expect("binary");
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for needle in ["serve", "status", "heartbeat", "cron", "runs", "events"] {
        assert!(output.contains(needle), "help should mention {needle}");
    }
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    let mut cmd = Command::cargo_bin("mu").expect("binary");
    cmd.arg("frobnicate").assert().failure().code(2);
}

#[test]
fn client_commands_fail_without_a_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("mu").expect("binary");
    cmd.args(["status", "--repo-root"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(1);
}
