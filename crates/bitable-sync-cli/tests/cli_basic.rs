//! Basic CLI E2E tests.
//!
//! Tests invoke the built binary against a temporary config and database.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Run the CLI with `--config <path>` and return (stdout, stderr, code).
fn run_cli(config: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_bitable-sync"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("BITABLE_SYNC_APP_SECRET")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

/// Config pointing at a database inside `dir`.
fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("config.toml");
    let db = dir.path().join("sync.db");
    let content = format!(
        r#"
[remote]
app_id = "cli_test"

[database]
path = "{}"

[logging]
level = "warn"

[[sync.tables]]
remote_table = "app:tbl"
relational_table = "users"

[sync.tables.fields]
"姓名" = "name"
"#,
        db.display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_config_path_echoes_explicit_path() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("nested").join("config.toml");
    let (stdout, _, code) = run_cli(&config, &["config", "path"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), config.display().to_string());
}

#[test]
fn test_config_init_then_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");

    let (stdout, _, code) = run_cli(&config, &["config", "init"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("wrote"));
    assert!(config.exists());

    let (_, stderr, code) = run_cli(&config, &["config", "init"]);
    assert_eq!(code, 1);
    assert!(stderr.starts_with("error:"));

    let (_, _, code) = run_cli(&config, &["config", "init", "--force"]);
    assert_eq!(code, 0);
}

#[test]
fn test_config_show_and_get() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let (stdout, _, code) = run_cli(&config, &["config", "show"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("remote_poll_interval_secs = 5"));
    assert!(stdout.contains("relational_table = \"users\""));

    let (stdout, _, code) = run_cli(&config, &["config", "get", "sync.tables.0.remote_table"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "app:tbl");

    let (_, stderr, code) = run_cli(&config, &["config", "get", "sync.nope"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("unknown key"));
}

#[test]
fn test_config_check_reports_missing_secret() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let (_, stderr, code) = run_cli(&config, &["config", "check"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("app_secret"));
}

#[test]
fn test_missing_explicit_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("absent.toml");
    let (_, stderr, code) = run_cli(&config, &["status"]);
    assert_eq!(code, 1);
    assert!(stderr.starts_with("error:"));
}

#[test]
fn test_status_json_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let (stdout, _, code) = run_cli(&config, &["status", "--json"]);
    assert_eq!(code, 0);

    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["queue"]["pending"], 0);
    assert_eq!(status["log"]["failed"], 0);
    assert_eq!(status["tables"]["users"]["remote_table"], "app:tbl");
    assert!(dir.path().join("sync.db").exists());
}

#[test]
fn test_queue_commands_on_empty_queue() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let (stdout, _, code) = run_cli(&config, &["queue", "list"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("no queue items"));

    let (stdout, _, code) = run_cli(&config, &["queue", "list", "--status", "failed", "--json"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "[]");

    let (stdout, _, code) = run_cli(&config, &["queue", "cleanup"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("removed 0 queue items and 0 log entries"));
}

#[test]
fn test_queue_list_rejects_unknown_status() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let (_, _, code) = run_cli(&config, &["queue", "list", "--status", "stuck"]);
    assert_ne!(code, 0);
}

#[test]
fn test_snapshot_reset() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let (stdout, _, code) = run_cli(&config, &["snapshot", "reset", "users"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("users"));

    let (_, stderr, code) = run_cli(&config, &["snapshot", "reset", "orders"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("orders"));
}

#[test]
fn test_once_requires_credentials() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let (_, stderr, code) = run_cli(&config, &["once"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("error:"));
}
