//! Integration tests for the agentbox CLI.
//!
//! These tests run the actual executable: the control commands against an
//! empty local backend, and the worker against a scratch IPC directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the agentbox binary.
#[allow(deprecated)]
fn agentbox() -> Command {
    Command::cargo_bin("agentbox").expect("failed to find agentbox binary")
}

/// Creates a Command using a local-backend config rooted in `dir`.
fn agentbox_local(dir: &TempDir) -> Command {
    let config = dir.path().join("agentbox.toml");
    fs::write(
        &config,
        format!(
            "[sandbox]\nbackend = \"local\"\nstate_dir = \"{}\"\n",
            dir.path().join("state").display()
        ),
    )
    .unwrap();

    let mut cmd = agentbox();
    cmd.current_dir(dir.path())
        .env_remove("AGENTBOX_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

/// A worker process that is killed when dropped.
struct WorkerProcess {
    child: Child,
    ipc: PathBuf,
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Starts `agentbox worker` with a scripted agent.
fn start_worker(dir: &TempDir, scripted: &str) -> WorkerProcess {
    let ipc = dir.path().join("ipc");
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();

    let config = dir.path().join("worker.toml");
    fs::write(
        &config,
        format!(
            "ipc_dir = \"{}\"\ndata_dir = \"{}\"\nstate_dir = \"{}\"\n\n\
             [timings]\npoll_interval_ms = 20\ninterrupt_poll_interval_ms = 20\n\n\
             [agent]\nprovider = \"scripted\"\n\n[agent.scripted]\n{scripted}\n",
            ipc.display(),
            data.display(),
            dir.path().join("agent-state").display()
        ),
    )
    .unwrap();

    let child = std::process::Command::new(env!("CARGO_BIN_EXE_agentbox"))
        .arg("worker")
        .arg("--config")
        .arg(&config)
        .env_remove("AGENTBOX_CONFIG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start worker");

    WorkerProcess { child, ipc }
}

/// Polls `check` until it returns true or `timeout` passes.
fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    false
}

/// Publishes a request the way the controller does: staged, then renamed.
fn submit(ipc: &Path, request_id: &str, message: &str) {
    let body = serde_json::json!({
        "request_id": request_id,
        "session_id": "s1",
        "user_message": message,
    });
    let staging = ipc.join(format!(".request-{request_id}.tmp"));
    fs::write(&staging, body.to_string()).unwrap();
    fs::rename(&staging, ipc.join("request.json")).unwrap();
}

/// Output log lines once the turn has finished.
fn finished_output(ipc: &Path) -> Vec<serde_json::Value> {
    let output = ipc.join("output.jsonl");
    let done = wait_for(Duration::from_secs(10), || {
        fs::read_to_string(&output)
            .map(|s| s.trim_end().ends_with("{\"type\":\"request_done\"}"))
            .unwrap_or(false)
    });
    assert!(done, "worker never finished the request");

    fs::read_to_string(&output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn types(events: &[serde_json::Value]) -> Vec<&str> {
    events.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    agentbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("agentbox"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("warm"))
        .stdout(predicate::str::contains("invalidate"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("interrupt"));
}

#[test]
fn test_version_shows_version() {
    agentbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("agentbox"));
}

#[test]
fn test_invalidate_help_shows_rewarm() {
    agentbox()
        .args(["invalidate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--rewarm"))
        .stdout(predicate::str::contains("--account"));
}

#[test]
fn test_unknown_command_suggests_help() {
    agentbox()
        .arg("unknown")
        .assert()
        .failure()
        .stderr(predicate::str::contains("help"));
}

// -----------------------------------------------------------------------------
// Control commands against an empty backend
// -----------------------------------------------------------------------------

#[test]
fn test_status_without_sandbox() {
    let dir = TempDir::new().unwrap();

    agentbox_local(&dir)
        .args(["status", "s1", "--account", "acct"])
        .assert()
        .success()
        .stdout(predicate::str::contains("agent-acct-s1"))
        .stdout(predicate::str::contains("No sandbox found"));
}

#[test]
fn test_invalidate_without_sandbox() {
    let dir = TempDir::new().unwrap();

    agentbox_local(&dir)
        .args(["invalidate", "s1", "--account", "acct"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sandbox found"));
}

#[test]
fn test_interrupt_without_sandbox() {
    let dir = TempDir::new().unwrap();

    agentbox_local(&dir)
        .args(["interrupt", "s1", "--account", "acct"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sandbox found"));
}

#[test]
fn test_account_resolved_from_catalog() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("catalog.toml"),
        "[[sessions]]\nid = \"s9\"\naccount_id = \"team-7\"\n",
    )
    .unwrap();

    agentbox_local(&dir)
        .args(["status", "s9"])
        .assert()
        .success()
        .stdout(predicate::str::contains("agent-team-7-s9"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("agentbox.toml");
    fs::write(&config, "[sandbox\nbackend = ").unwrap();

    agentbox()
        .arg("--config")
        .arg(&config)
        .args(["status", "s1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

// -----------------------------------------------------------------------------
// Worker process tests
// -----------------------------------------------------------------------------

#[test]
fn test_worker_missing_config() {
    agentbox()
        .args(["worker", "--config", "/nonexistent/worker.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read worker config"));
}

#[test]
fn test_worker_answers_request() {
    let dir = TempDir::new().unwrap();
    let worker = start_worker(&dir, "reply = \"four\"");
    assert!(
        wait_for(Duration::from_secs(10), || worker.ipc.join("ready").exists()),
        "worker never became ready"
    );

    submit(&worker.ipc, "r1", "What is 2+2?");
    let events = finished_output(&worker.ipc);

    assert_eq!(events[0]["type"], "worker_processing");
    assert_eq!(events[0]["request_id"], "r1");
    assert!(events
        .iter()
        .any(|e| e["type"] == "text" && e["content"] == "four"));
    assert_eq!(
        &types(&events)[events.len() - 2..],
        &["done", "request_done"]
    );
    assert!(!worker.ipc.join("request.json").exists());
    assert!(worker.ipc.join("worker.log").exists());
}

#[test]
fn test_worker_stops_on_interrupt() {
    let dir = TempDir::new().unwrap();
    let worker = start_worker(
        &dir,
        "reply = \"a long story told slowly\"\nchunks = 20\nstep_delay_ms = 100",
    );
    assert!(wait_for(Duration::from_secs(10), || worker
        .ipc
        .join("ready")
        .exists()));

    submit(&worker.ipc, "r2", "tell me a story");
    let output = worker.ipc.join("output.jsonl");
    assert!(wait_for(Duration::from_secs(10), || {
        fs::read_to_string(&output)
            .map(|s| s.contains("\"type\":\"text\""))
            .unwrap_or(false)
    }));
    fs::write(worker.ipc.join("interrupt"), b"").unwrap();

    let events = finished_output(&worker.ipc);
    let kinds = types(&events);
    let stopped = kinds
        .iter()
        .position(|t| *t == "interrupted")
        .expect("no interrupted event");
    assert!(!kinds[stopped..].contains(&"text"));
    assert!(kinds.iter().filter(|t| **t == "text").count() < 20);

    let done = &events[events.len() - 2];
    assert_eq!(done["type"], "done");
    assert_eq!(done["interrupted"], true);
    assert!(!worker.ipc.join("interrupt").exists());
}
