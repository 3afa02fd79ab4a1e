//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use serde_json::Value;

/// Get the binary to test, pointed at a store inside `dir`.
fn flowstate(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("flowstate").unwrap();
    cmd.current_dir(dir.path())
        .env("FLOWSTATE_STORE", dir.child("state/workflow.json").path())
        .env_remove("FLOWSTATE_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

/// Run a command that must succeed and return its `data` field.
fn run_ok(dir: &TempDir, args: &[&str]) -> Value {
    let output = flowstate(dir).args(args).assert().success().get_output().stdout.clone();
    let outcome: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(outcome["success"], true, "{outcome}");
    outcome["data"].clone()
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    let dir = TempDir::new().unwrap();
    flowstate(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Durable workflow state"));
}

#[test]
fn test_version_flag() {
    let dir = TempDir::new().unwrap();
    flowstate(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// Workflow Command Tests
// ============================================================================

#[test]
fn test_task_lifecycle() {
    let dir = TempDir::new().unwrap();

    let flow = run_ok(&dir, &["flow", "create", "release", "--meta", "owner=ops"]);
    assert_eq!(flow["metadata"]["owner"], "ops");
    let flow_id = flow["id"].as_str().unwrap().to_string();

    let plan = run_ok(&dir, &["plan", "create", &flow_id, "v1.0"]);
    let plan_id = plan["id"].as_str().unwrap().to_string();

    let task = run_ok(&dir, &["task", "add", &plan_id, "Tag release"]);
    let task_id = task["id"].as_str().unwrap().to_string();

    let started = run_ok(&dir, &["task", "start", &task_id]);
    assert_eq!(started["status"], "in_progress");

    let done = run_ok(&dir, &["task", "complete", &task_id, "--notes", "shipped"]);
    assert_eq!(done["status"], "completed");
    assert_eq!(done["notes"], "shipped");

    let status = run_ok(&dir, &["status"]);
    assert_eq!(status["flows"][0]["plans"][0]["status"], "completed");

    dir.child("state/workflow.json").assert(predicate::path::exists());
}

#[test]
fn test_conflict_exits_with_failure() {
    let dir = TempDir::new().unwrap();
    let flow = run_ok(&dir, &["flow", "create", "f"]);
    let plan = run_ok(&dir, &["plan", "create", flow["id"].as_str().unwrap(), "p"]);
    let plan_id = plan["id"].as_str().unwrap();
    let a = run_ok(&dir, &["task", "add", plan_id, "a"]);
    let b = run_ok(&dir, &["task", "add", plan_id, "b"]);

    run_ok(&dir, &["task", "start", a["id"].as_str().unwrap()]);
    flowstate(&dir)
        .args(["task", "start", b["id"].as_str().unwrap()])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"error_code\": \"CONFLICT\""));
}

#[test]
fn test_unknown_task_is_not_found() {
    let dir = TempDir::new().unwrap();
    flowstate(&dir)
        .args(["task", "start", "missing"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("NOT_FOUND"));
}

#[test]
fn test_invalid_metadata_is_rejected() {
    let dir = TempDir::new().unwrap();
    flowstate(&dir)
        .args(["flow", "create", "f", "--meta", "no-equals-sign"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("VALIDATION"));
}

// ============================================================================
// Backup Command Tests
// ============================================================================

#[test]
fn test_backup_create_and_list() {
    let dir = TempDir::new().unwrap();
    run_ok(&dir, &["flow", "create", "f"]);

    let backup = run_ok(&dir, &["backup", "create"]);
    let name = backup["name"].as_str().unwrap().to_string();
    assert!(name.ends_with("_manual.json"));

    let backups = run_ok(&dir, &["backup", "list"]);
    assert!(backups.as_array().unwrap().iter().any(|b| b["name"] == name.as_str()));

    run_ok(&dir, &["backup", "restore", &name]);
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_shows_defaults() {
    let dir = TempDir::new().unwrap();
    flowstate(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[store]"))
        .stdout(predicate::str::contains("lock_timeout_ms"));
}

#[test]
fn test_config_from_local_file() {
    let dir = TempDir::new().unwrap();
    dir.child(".flowstate.toml").write_str("[bus]\nmax_retries = 7\n").unwrap();
    flowstate(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_retries = 7"));
}

#[test]
fn test_completions() {
    let dir = TempDir::new().unwrap();
    flowstate(&dir)
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flowstate"));
}
