use std::path::Path;
use std::process::{Command, Output};

use crate::common::{TraceFixture, assert_contains, init_test_logging};

fn dbc(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dbc"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run dbc")
}

#[test]
fn test_dbc_help_includes_usage() {
    init_test_logging();
    crate::test_log!("TEST START: test_dbc_help_includes_usage");

    let output = Command::new(env!("CARGO_BIN_EXE_dbc"))
        .arg("--help")
        .output()
        .expect("Failed to run dbc --help");

    assert!(output.status.success(), "dbc --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "critical-path");
    assert_contains(&stdout, "config");

    crate::test_log!("TEST PASS: test_dbc_help_includes_usage");
}

#[test]
fn test_dbc_version() {
    init_test_logging();
    let output = Command::new(env!("CARGO_BIN_EXE_dbc"))
        .arg("--version")
        .output()
        .expect("Failed to run dbc --version");
    assert!(output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stdout), env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_critical_path_text_report() {
    init_test_logging();
    crate::test_log!("TEST START: test_critical_path_text_report");
    let fixture = TraceFixture::chain();

    let output = dbc(
        &fixture.config,
        &["critical-path", "--trace", fixture.trace.to_str().unwrap()],
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_contains(&stdout, "Critical path: //app:c (40 ms, 3 rules)");
    assert_contains(&stdout, "Minion m2: 2 rules on 2 threads");

    crate::test_log!("TEST PASS: test_critical_path_text_report");
}

#[test]
fn test_critical_path_json_report() {
    init_test_logging();
    let fixture = TraceFixture::chain();

    let output = dbc(
        &fixture.config,
        &["--json", "critical-path", "--trace", fixture.trace.to_str().unwrap()],
    );
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");

    let path: Vec<&str> = report["critical_path"]
        .as_array()
        .expect("critical_path array")
        .iter()
        .map(|entry| entry["rule"].as_str().unwrap())
        .collect();
    assert_eq!(path, vec!["//app:c", "//lib:b", "//lib:a"]);
    assert_eq!(report["longest_chain_ms"], 40);
}

#[test]
fn test_critical_path_rejects_malformed_trace() {
    init_test_logging();
    let fixture = TraceFixture::with_trace("{ not json");

    let output = dbc(
        &fixture.config,
        &["critical-path", "--trace", fixture.trace.to_str().unwrap()],
    );
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "failed to parse trace");
}

#[test]
fn test_config_reports_sources() {
    init_test_logging();
    let fixture = TraceFixture::chain();
    fixture.write_config(
        r#"
[remote]
mode = "wait_for_remote"
kill_timeout_secs = 5
"#,
    );

    let output = dbc(&fixture.config, &["config"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "remote.mode = wait_for_remote  (file)");
    assert_contains(&stdout, "remote.kill_timeout_secs = 5  (file)");
    assert_contains(&stdout, "uploader.worker_count = 4  (default)");
}

#[test]
fn test_config_rejects_invalid_values() {
    init_test_logging();
    let fixture = TraceFixture::chain();
    fixture.write_config("[uploader]\nworker_count = 0\n");

    let output = dbc(&fixture.config, &["config"]);
    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stderr), "failed to load configuration");
}
