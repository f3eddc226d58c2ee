//! Command-line behavior of the `loadstorm` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn loadstorm() -> Command {
    let mut cmd = Command::cargo_bin("loadstorm").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("LOADSTORM_BEARER_TOKEN")
        .env_remove("LOADSTORM_AUTH_PASSWORD");
    cmd
}

/// Flags for a short fixed-mode run with no ramp or think time.
const QUICK: [&str; 13] = [
    "--mode",
    "fixed",
    "--users",
    "2",
    "--requests",
    "3",
    "--ramp-up",
    "0",
    "--think-min",
    "0",
    "--think-max",
    "0",
    "--no-color",
];

#[test]
fn test_help_lists_subcommands() {
    loadstorm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_run_help_lists_flags() {
    loadstorm()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-error-rate"))
        .stdout(predicate::str::contains("--workflow"))
        .stdout(predicate::str::contains("--output-format"))
        .stdout(predicate::str::contains("--validate-json-path"))
        .stdout(predicate::str::contains("--auth-type"));
}

#[test]
fn test_run_without_url_fails() {
    loadstorm()
        .args(["run", "--no-report"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no target URL"));
}

#[test]
fn test_run_rejects_unsupported_scheme() {
    loadstorm()
        .args(["run", "ftp://example.com/file", "--no-report"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid test plan"));
}

#[test]
fn test_run_against_mock_server_prints_summary() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/ping")
        .with_status(200)
        .with_body("pong")
        .expect(6)
        .create();

    loadstorm()
        .arg("run")
        .arg(format!("{}/ping", server.url()))
        .args(QUICK)
        .arg("--no-report")
        .assert()
        .success()
        .stdout(predicate::str::contains("req_total"))
        .stdout(predicate::str::contains("fixed (3 per user)"));

    mock.assert();
}

#[test]
fn test_run_writes_report() {
    let mut server = mockito::Server::new();
    server.mock("GET", "/").with_status(200).create();
    let dir = tempfile::tempdir().unwrap();

    loadstorm()
        .current_dir(dir.path())
        .arg("run")
        .arg(server.url())
        .args(QUICK)
        .assert()
        .success()
        .stderr(predicate::str::contains("Report written to"));

    let reports: Vec<_> = std::fs::read_dir(dir.path().join("loadstorm-reports"))
        .unwrap()
        .collect();
    assert_eq!(reports.len(), 1);
}

#[test]
fn test_run_writes_csv_reports_to_output_file() {
    let mut server = mockito::Server::new();
    server.mock("GET", "/").with_status(200).create();
    let dir = tempfile::tempdir().unwrap();

    loadstorm()
        .current_dir(dir.path())
        .arg("run")
        .arg(server.url())
        .args(QUICK)
        .args(["--output-format", "csv", "--output-file", "out/smoke"])
        .assert()
        .success()
        .stderr(predicate::str::contains("smoke_summary.csv"))
        .stderr(predicate::str::contains("smoke_history.csv"));

    let summary = std::fs::read_to_string(dir.path().join("out/smoke_summary.csv")).unwrap();
    assert!(summary.starts_with("metric,value"));
    assert!(summary.contains("total_requests,6"));
    assert!(dir.path().join("out/smoke_history.csv").exists());
    assert!(!dir.path().join("out/smoke.json").exists());
    assert!(!dir.path().join("loadstorm-reports").exists());
}

#[test]
fn test_run_validation_flags_fail_mismatched_responses() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/")
        .with_status(200)
        .with_body(r#"{"state":"starting"}"#)
        .create();

    loadstorm()
        .arg("run")
        .arg(server.url())
        .args(QUICK)
        .args(["--validate-json-path", "$.state", "--validate-json-value", "ready"])
        .args(["--output-format", "console", "--max-error-rate", "0.5"])
        .assert()
        .code(2);
}

#[test]
fn test_error_rate_threshold_exit_code() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    loadstorm()
        .arg("run")
        .arg(format!("http://127.0.0.1:{port}/"))
        .args(QUICK)
        .args(["--no-report", "--max-error-rate", "0.5"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("exceeds --max-error-rate"));
}

#[test]
fn test_init_writes_starter_plan() {
    let dir = tempfile::tempdir().unwrap();

    loadstorm()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stderr(predicate::str::contains("Created"));

    let content = std::fs::read_to_string(dir.path().join("loadstorm.toml")).unwrap();
    assert!(content.contains("[settings]"));
}

#[test]
fn test_init_refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.toml");
    std::fs::write(&path, "existing").unwrap();

    loadstorm()
        .args(["init", "--output"])
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--force"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing");

    loadstorm()
        .args(["init", "--force", "--output"])
        .arg(&path)
        .assert()
        .success();
    assert_ne!(std::fs::read_to_string(&path).unwrap(), "existing");
}
