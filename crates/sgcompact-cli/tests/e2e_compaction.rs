//! E2E CLI tests: seed a database, compact it, query state and order.
//!
//! Each test runs the `sgcompact` binary as a subprocess against a database
//! in an isolated temp directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCOPE: &str = "!e2e:example.org";

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn sg_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("sgcompact"));
    cmd.current_dir(dir);
    cmd.env("SGCOMPACT_LOG", "error");
    cmd.env_remove("SGCOMPACT_FORMAT");
    cmd
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("state.sqlite3")
}

fn run_json(dir: &TempDir, args: &[&str]) -> Value {
    let db = db_path(dir);
    let output = sg_cmd(dir.path())
        .args(args)
        .args(["--db", db.to_str().expect("utf-8 path"), "--json"])
        .output()
        .expect("command should not crash");
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON")
}

fn seed(dir: &TempDir, groups: usize) -> Value {
    let groups = groups.to_string();
    run_json(dir, &["seed", "--scope", SCOPE, "--seed", "3", "--groups", &groups])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn seed_then_compact_reports_every_group() {
    let dir = TempDir::new().expect("temp dir");
    let seeded = seed(&dir, 30);
    assert_eq!(seeded["groups"], 30);

    let report = run_json(&dir, &["compact", "--scope", SCOPE, "--batch-size", "4"]);
    assert_eq!(report["scope"], SCOPE);
    assert_eq!(report["groups"], 30);
    assert_eq!(report["steps"], 30);
    assert_eq!(report["order"], "ascending");
    assert!(report["rows_written"].as_u64().expect("rows") > 0);
    assert!(report["edge_hash"].as_str().expect("hash").starts_with("blake3:"));
}

#[test]
fn current_state_matches_last_step() {
    let dir = TempDir::new().expect("temp dir");
    seed(&dir, 25);
    run_json(&dir, &["compact", "--scope", SCOPE, "--order", "chunked"]);

    let current = run_json(&dir, &["state", "--scope", SCOPE]);
    assert_eq!(current["recorded_steps"], 25);
    let last = run_json(&dir, &["state", "--scope", SCOPE, "--at", "24"]);
    assert_eq!(current["entries"], last["entries"]);

    let first = run_json(&dir, &["state", "--scope", SCOPE, "--at", "0"]);
    assert!(first["entries"].as_array().expect("entries").len() <= 3);
}

#[test]
fn order_lists_each_group_once() {
    let dir = TempDir::new().expect("temp dir");
    seed(&dir, 20);

    for strategy in ["ascending", "chunked", "stored"] {
        let out = run_json(&dir, &["order", "--scope", SCOPE, "--order", strategy]);
        let mut groups: Vec<i64> = out["groups"]
            .as_array()
            .expect("groups")
            .iter()
            .map(|g| g.as_i64().expect("id"))
            .collect();
        assert_eq!(groups.len(), 20, "{strategy}");
        groups.sort_unstable();
        groups.dedup();
        assert_eq!(groups.len(), 20, "{strategy}");
    }
}

#[test]
fn text_order_prints_one_group_per_line() {
    let dir = TempDir::new().expect("temp dir");
    seed(&dir, 10);
    let db = db_path(&dir);

    let output = sg_cmd(dir.path())
        .args(["order", "--scope", SCOPE, "--format", "text", "--db"])
        .arg(&db)
        .output()
        .expect("command should not crash");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf-8");
    assert_eq!(stdout.lines().count(), 10);
    assert!(stdout.lines().all(|line| line.parse::<i64>().is_ok()));
}

#[test]
fn unknown_scope_fails_with_error_code() {
    let dir = TempDir::new().expect("temp dir");
    seed(&dir, 5);
    let db = db_path(&dir);

    let output = sg_cmd(dir.path())
        .args(["compact", "--scope", "!missing:example.org", "--json", "--db"])
        .arg(&db)
        .output()
        .expect("command should not crash");
    assert_eq!(output.status.code(), Some(1));
    let error: Value = serde_json::from_slice(&output.stderr).expect("JSON error");
    assert_eq!(error["error"]["error_code"], "E2001");
    assert!(error["error"]["suggestion"].is_string());
}

#[test]
fn invalid_batch_size_is_a_config_error() {
    let dir = TempDir::new().expect("temp dir");
    seed(&dir, 5);
    let db = db_path(&dir);

    sg_cmd(dir.path())
        .args(["compact", "--scope", SCOPE, "--batch-size", "0", "--format", "text", "--db"])
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[E1001]"));
}

#[test]
fn config_file_supplies_defaults() {
    let dir = TempDir::new().expect("temp dir");
    seed(&dir, 12);
    std::fs::write(dir.path().join("sgcompact.toml"), "order = \"stored\"\nbatch_size = 2\n")
        .expect("write config");

    let report = run_json(&dir, &["compact", "--scope", SCOPE]);
    assert_eq!(report["order"], "stored");
    assert_eq!(report["batches"], 6);
}

#[test]
fn small_sim_campaign_passes() {
    let dir = TempDir::new().expect("temp dir");
    let output = sg_cmd(dir.path())
        .args(["sim", "--seeds", "0..5", "--groups", "15", "--json"])
        .output()
        .expect("command should not crash");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stdout));
    let report: Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(report["seeds_run"], 5);
    assert_eq!(report["all_passed"], true);
}

#[test]
fn completions_are_generated() {
    let dir = TempDir::new().expect("temp dir");
    sg_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sgcompact"));
}
