//! CLI integration tests for the `ingest` and `settings` subcommands.
//!
//! Uses `assert_cmd` to spawn the `logreplay` binary and verify
//! exit codes, stdout content, and stderr content. Every test works on its
//! own database in a temporary directory.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn traces_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/traces")
}

/// Helper: create a Command for the `logreplay` binary, rooted in `dir`
/// with no `REPLAY_*` overrides from the calling environment.
fn logreplay(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("logreplay");
    cmd.current_dir(dir.path());
    for var in [
        "REPLAY_DB",
        "REPLAY_HOST",
        "REPLAY_PORT",
        "REPLAY_MAX_IN_FLIGHT",
        "REPLAY_LOG",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn db_arg(dir: &TempDir) -> String {
    dir.path().join("events.db").display().to_string()
}

fn ingest_json(dir: &TempDir, extra: &[&str]) -> serde_json::Value {
    let output = logreplay(dir)
        .args(["--output", "json", "--db", &db_arg(dir), "ingest"])
        .arg(traces_dir())
        .args(extra)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Replay recorded CPEE process logs"));
}

#[test]
fn version_exits_0() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("logreplay"));
}

// ──────────────────────────────────────────────
// 2. Ingest
// ──────────────────────────────────────────────

#[test]
fn ingest_reports_json_summary() {
    let dir = TempDir::new().unwrap();
    let report = ingest_json(&dir, &[]);
    assert_eq!(report["table"], "calls");
    assert_eq!(report["mode"], "replace");
    assert_eq!(report["files"], 1);
    assert_eq!(report["records"], 2);
    assert_eq!(report["inserted"], 2);
    assert_eq!(report["instances"], 1);
    assert_eq!(report["start_records"], 1);
}

#[test]
fn ingest_text_summary() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "ingest"])
        .arg(traces_dir())
        .args(["--table", "exp1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("into table 'exp1'"))
        .stdout(predicate::str::contains("2 inserted"));
}

#[test]
fn ingest_replace_then_append() {
    let dir = TempDir::new().unwrap();
    ingest_json(&dir, &[]);

    let replaced = ingest_json(&dir, &[]);
    assert_eq!(replaced["cleared"], 2);
    assert_eq!(replaced["inserted"], 2);

    let appended = ingest_json(&dir, &["--append"]);
    assert_eq!(appended["mode"], "append");
    assert_eq!(appended["inserted"], 0);
    assert_eq!(appended["duplicates"], 2);
}

#[test]
fn ingest_uses_active_table_setting() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "set", "active_table", "staging"])
        .assert()
        .success();
    let report = ingest_json(&dir, &[]);
    assert_eq!(report["table"], "staging");
}

#[test]
fn ingest_records_source_directory() {
    let dir = TempDir::new().unwrap();
    ingest_json(&dir, &[]);
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "get", "last_loaded_directory"])
        .assert()
        .success()
        .stdout(predicate::str::contains("traces"));
}

#[test]
fn ingest_missing_directory_exits_1() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "ingest", "no-such-dir"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no-such-dir"));
}

#[test]
fn ingest_rejects_reserved_table_name() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--output", "json", "--db", &db_arg(&dir), "ingest"])
        .arg(traces_dir())
        .args(["--table", "_settings"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("\"error\""));
}

// ──────────────────────────────────────────────
// 3. Settings
// ──────────────────────────────────────────────

#[test]
fn settings_set_then_get() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "set", "replay_table", "exp1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exp1"));
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "get", "replay_table"])
        .assert()
        .success()
        .stdout("exp1\n");
}

#[test]
fn settings_get_json() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "set", "replay_table", "exp1"])
        .assert()
        .success();
    let output = logreplay(&dir)
        .args(["--output", "json", "--db", &db_arg(&dir), "settings", "get", "replay_table"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value, serde_json::json!({ "key": "replay_table", "value": "exp1" }));
}

#[test]
fn settings_get_missing_exits_1() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "get", "replay_table"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not set"));
}

#[test]
fn settings_reject_invalid_table_name() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "set", "replay_table", "_tables"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn quiet_suppresses_errors() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--quiet", "--db", &db_arg(&dir), "settings", "get", "replay_table"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::is_empty());
}

// ──────────────────────────────────────────────
// 4. Configuration
// ──────────────────────────────────────────────

#[test]
fn database_path_from_environment() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .env("REPLAY_DB", db_arg(&dir))
        .args(["settings", "set", "note", "hello"])
        .assert()
        .success();
    logreplay(&dir)
        .args(["--db", &db_arg(&dir), "settings", "get", "note"])
        .assert()
        .success()
        .stdout("hello\n");
}

#[test]
fn database_path_from_config_file() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("replay.toml");
    std::fs::write(&config, "[database]\npath = \"from-config.db\"\n").unwrap();
    logreplay(&dir)
        .arg("--config")
        .arg(&config)
        .args(["settings", "set", "note", "configured"])
        .assert()
        .success();
    assert!(dir.path().join("from-config.db").exists());
}

#[test]
fn missing_config_file_exits_1() {
    let dir = TempDir::new().unwrap();
    logreplay(&dir)
        .args(["--config", "absent.toml", "settings", "get", "note"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("absent.toml"));
}

#[test]
fn malformed_config_file_exits_1() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("replay.toml");
    std::fs::write(&config, "[server]\nport = \"eighty\"\n").unwrap();
    logreplay(&dir)
        .arg("--config")
        .arg(&config)
        .args(["settings", "get", "note"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("could not parse"));
}
