//! Integration tests: harness CLI.
//!
//! Validates:
//! 1. `clock-sources --json` lists auto plus the five named sources.
//! 2. `scenarios` runs the selected scenarios and writes a schema-valid log.
//! 3. `validate-log` rejects malformed entries with a non-zero exit.
//! 4. An invalid clock source aborts setup.

use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_tmp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after UNIX_EPOCH")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn harness() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_harness"));
    for key in [
        "FRANKENTHREAD_CLOCK_SOURCE",
        "FRANKENTHREAD_WAIT_BACKEND",
        "FRANKENTHREAD_LOG",
        "FRANKENTHREAD_LOG_LEVEL",
    ] {
        command.env_remove(key);
    }
    command
}

#[test]
fn clock_sources_json_lists_every_choice() {
    let output = harness()
        .args(["clock-sources", "--json"])
        .output()
        .expect("harness clock-sources should execute");
    assert!(output.status.success());
    let rows: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("CLI should emit JSON rows");
    let values: Vec<&str> = rows
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|row| row["value"].as_str())
        .collect();
    assert_eq!(values, ["", "interrupt", "tick", "multimedia", "perf", "wall"]);
}

#[test]
fn scenarios_pass_and_log_validates() {
    let dir = unique_tmp_dir("frankenthread-scenarios");
    let log = dir.join("run.jsonl");
    let output = harness()
        .args(["--clock-source", "perf", "scenarios", "--log"])
        .arg(&log)
        .args(["--only", "static_mutex_counter", "--only", "cancel_runs_cleanup_lifo"])
        .output()
        .expect("harness scenarios should execute");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("CLI should emit a JSON report");
    assert_eq!(report["total"].as_u64(), Some(2));
    assert_eq!(report["failed"].as_u64(), Some(0));
    assert_eq!(report["clock_source"].as_str(), Some("perf"));

    let validated = harness()
        .arg("validate-log")
        .arg("--log")
        .arg(&log)
        .output()
        .expect("harness validate-log should execute");
    assert!(validated.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&validated.stdout).expect("json");
    assert_eq!(summary["ok"].as_bool(), Some(true));
    assert!(summary["lines"].as_u64().unwrap_or(0) >= 3);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn validate_log_rejects_malformed_entries() {
    let dir = unique_tmp_dir("frankenthread-bad-log");
    let log = dir.join("bad.jsonl");
    std::fs::write(
        &log,
        "{\"timestamp\":\"yesterday\",\"trace_id\":\"x\",\"level\":\"loud\",\"event\":\"e\"}\nnot json\n",
    )
    .expect("write log");
    let output = harness()
        .arg("validate-log")
        .arg("--log")
        .arg(&log)
        .output()
        .expect("harness validate-log should execute");
    assert!(!output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(summary["ok"].as_bool(), Some(false));
    assert_eq!(summary["lines"].as_u64(), Some(2));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn unknown_scenario_is_an_error() {
    let output = harness()
        .args(["scenarios", "--only", "teleport"])
        .output()
        .expect("harness scenarios should execute");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("teleport"));
}

#[test]
fn invalid_clock_source_aborts() {
    let output = harness()
        .args(["--clock-source", "sundial", "scenarios", "--only", "perf_clock_monotonic"])
        .output()
        .expect("harness should execute");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("sundial"));
}
