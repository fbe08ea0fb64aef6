use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run(state_dir: &Path, args: &[&str]) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_mls-replicator");
    Command::new(bin_path)
        .current_dir(state_dir)
        .args(args)
        .arg("--state-dir")
        .arg(state_dir)
        .arg("--log")
        .arg("error")
        .env_remove("RUST_LOG")
        .env_remove("MLSGRID_API_TOKEN")
        .env_remove("MLS_REPLICATOR_CONFIG")
        .env_remove("MLSGRID_SYSTEM")
        .env_remove("MLSGRID_API_URL")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_cursor_command() {
    let temp_dir = tempdir().unwrap();
    let state_dir = temp_dir.path();

    // Nothing replicated yet
    let output = run(state_dir, &["cursor"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for kind in ["Property", "Member", "Office", "OpenHouse"] {
        assert!(stdout.contains(kind), "missing {kind} in {stdout}");
    }
    assert_eq!(stdout.matches("unset").count(), 4);

    fs::write(
        state_dir.join("cursors.json"),
        r#"{
  "version": 1,
  "system": "mred",
  "cursors": {
    "Member": {
      "resource": "Member",
      "last_modification_timestamp": "2024-03-01T10:00:00.000Z",
      "updated_at": "2024-03-01T10:00:05Z"
    }
  },
  "created_at": "2024-03-01T09:00:00Z",
  "updated_at": "2024-03-01T10:00:05Z"
}"#,
    )
    .unwrap();

    let output = run(state_dir, &["cursor", "--resource", "member"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Member"));
    assert!(stdout.contains("2024-03-01T10:00:00.000Z"));
    assert!(!stdout.contains("Property"));
}

#[test]
fn test_reset_command() {
    let temp_dir = tempdir().unwrap();
    let state_dir = temp_dir.path();
    fs::write(state_dir.join("Office.json"), "[\n]\n").unwrap();
    fs::write(
        state_dir.join("cursors.json"),
        r#"{"version":1,"system":"mred","cursors":{},"created_at":"2024-03-01T09:00:00Z","updated_at":"2024-03-01T09:00:00Z"}"#,
    )
    .unwrap();

    let output = run(state_dir, &["reset", "--yes"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Removed cursors and output"));
    assert!(!state_dir.join("Office.json").exists());
    assert!(!state_dir.join("cursors.json").exists());
}

#[test]
fn test_incremental_without_cursor_fails() {
    let temp_dir = tempdir().unwrap();
    let output = run(temp_dir.path(), &["replicate", "--resource", "open-house"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("requires a stored cursor"), "{stderr}");
}

#[test]
fn test_missing_token_fails_before_fetching() {
    let temp_dir = tempdir().unwrap();
    let output = run(
        temp_dir.path(),
        &[
            "replicate",
            "--resource",
            "property",
            "--initial",
            "--api-url",
            "http://127.0.0.1:9",
        ],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("MLSGRID_API_TOKEN"), "{stderr}");
    assert!(!temp_dir.path().join("Property.json").exists());
    assert!(!temp_dir.path().join("Property.lock").exists());
}

#[test]
fn test_rejects_invalid_system() {
    let temp_dir = tempdir().unwrap();
    let output = run(temp_dir.path(), &["cursor", "--system", "bad name"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad name"), "{stderr}");
}

#[test]
fn test_token_is_read_from_dotenv_file() {
    let temp_dir = tempdir().unwrap();
    let state_dir = temp_dir.path();
    fs::write(state_dir.join(".env"), "MLSGRID_API_TOKEN=from-dotenv\n").unwrap();
    let config_path = state_dir.join("replicator.toml");
    fs::write(
        &config_path,
        "request_interval_ms = 0\nmax_attempts = 1\nrequest_timeout_secs = 5\n",
    )
    .unwrap();

    // Nothing listens on the discard port, so the token gets as far as a fetch
    let output = run(
        state_dir,
        &[
            "replicate",
            "--resource",
            "property",
            "--initial",
            "--api-url",
            "http://127.0.0.1:9",
            "--config",
            config_path.to_str().unwrap(),
        ],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("is not set"), "{stderr}");
    assert!(stderr.contains("failed after 1 attempts"), "{stderr}");
}
