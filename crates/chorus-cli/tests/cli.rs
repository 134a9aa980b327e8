#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Runs the `chorus` binary against a scratch directory.

use std::path::Path;
use std::process::{Command, Output};

fn chorus(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_chorus"))
        .arg("-C")
        .arg(root)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("chorus binary runs")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_task_add_and_list() {
    let tmp = tempfile::tempdir().unwrap();

    let first = chorus(tmp.path(), &["task", "add", "Create schema", "-p", "1"]);
    assert!(first.status.success(), "{first:?}");
    assert_eq!(stdout(&first).trim(), "ch-1");

    let second = chorus(
        tmp.path(),
        &["task", "add", "Expose API", "--type", "feature", "--after", "ch-1", "--tag", "backend"],
    );
    assert!(second.status.success(), "{second:?}");
    assert_eq!(stdout(&second).trim(), "ch-2");

    let all = stdout(&chorus(tmp.path(), &["task", "list"]));
    assert!(all.contains("ch-1") && all.contains("P1 Create schema"));
    assert!(all.contains("Expose API  (after ch-1)"));

    let ready = stdout(&chorus(tmp.path(), &["task", "list", "--status", "ready"]));
    assert!(ready.contains("ch-1"));
    assert!(!ready.contains("ch-2"));

    let lines = std::fs::read_to_string(tmp.path().join(".chorus/tasks.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), 2);
}

#[test]
fn test_unknown_dependency_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let out = chorus(tmp.path(), &["task", "add", "orphan", "--after", "ch-9"]);
    assert!(!out.status.success());
    assert!(!tmp.path().join(".chorus/tasks.jsonl").exists());
}

#[test]
fn test_config_sets_prefix_and_data_dir() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("chorus.toml"),
        "data_dir = \"state\"\n\n[orchestrator]\ntask_prefix = \"web\"\n",
    )
    .unwrap();

    let out = chorus(tmp.path(), &["task", "add", "landing page"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(stdout(&out).trim(), "web-1");
    assert!(tmp.path().join("state/tasks.jsonl").exists());
}

#[test]
fn test_custom_prefix_keeps_ids_unique_across_runs() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("chorus.toml"), "[orchestrator]\ntask_prefix = \"web\"\n").unwrap();

    let first = chorus(tmp.path(), &["task", "add", "landing page"]);
    let second = chorus(tmp.path(), &["task", "add", "pricing page"]);
    assert_eq!(stdout(&first).trim(), "web-1");
    assert_eq!(stdout(&second).trim(), "web-2");

    let list = chorus(tmp.path(), &["task", "list"]);
    assert!(list.status.success(), "{list:?}");
    let listed = stdout(&list);
    assert!(listed.contains("landing page") && listed.contains("pricing page"));
    let lines = std::fs::read_to_string(tmp.path().join(".chorus/tasks.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), 2);
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("chorus.toml"), "[orchestrator]\nmax_agents = 0\n").unwrap();
    let out = chorus(tmp.path(), &["task", "list"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("max_agents"));
}
