//! CLI integration tests

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("huddle")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("join"))
        .stdout(predicate::str::contains("ticket"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("huddle")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_ticket_rejects_garbage() {
    Command::cargo_bin("huddle")
        .unwrap()
        .args(["ticket", "not-a-ticket"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid ticket"));
}

#[test]
fn test_join_rejects_ticket_on_memory_relay() {
    Command::cargo_bin("huddle")
        .unwrap()
        .args(["join", "r1", "--ticket", "huddle-room:xyz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--relay gossip"));
}
