//! CLI integration tests for the klaviyo-relay command-line interface.
//!
//! None of these need Klaviyo or a running proxy. Config discovery and
//! log output are pointed at a temp dir per test.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the klaviyo-relay binary, sandboxed to `dir`.
fn relay(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("klaviyo-relay").unwrap();
    cmd.current_dir(dir.path())
        .env("KLAVIYO_RELAY_CONFIG_DIR", dir.path().join("config"))
        .env("KLAVIYO_RELAY_DATA_DIR", dir.path().join("data"))
        .env_remove("KLAVIYO_RELAY_CONFIG")
        .env_remove("KLAVIYO_RELAY_URL")
        .env_remove("KLAVIYO_EMAIL")
        .env_remove("KLAVIYO_PASSWORD")
        .env_remove("KLAVIYO_TOTP_SECRET")
        .env_remove("CAPTCHA_API_KEY")
        .env_remove("RUST_LOG");
    cmd
}

/// A relay URL nothing listens on.
const DEAD_RELAY: &str = "http://127.0.0.1:9";

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Authenticated Klaviyo session proxy"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("login"))
        .stdout(predicate::str::contains("supervise"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("reload"))
        .stdout(predicate::str::contains("save"))
        .stdout(predicate::str::contains("totp"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("klaviyo-relay"));
}

#[test]
fn test_serve_help_shows_overrides() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--bind"))
        .stdout(predicate::str::contains("--supervise"));
}

#[test]
fn test_unknown_subcommand_rejected() {
    let dir = TempDir::new().unwrap();
    relay(&dir).arg("frobnicate").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Totp
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_totp_prints_six_digits() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["totp", "--secret", "JFC7FMIAQVM423A6"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\d{6} \(valid \d+s\)\n$").unwrap());
}

#[test]
fn test_totp_json_output() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["--json", "totp", "--secret", "JFC7FMIAQVM423A6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"code\""))
        .stdout(predicate::str::contains("\"expires_in_secs\""));
}

#[test]
fn test_totp_reads_secret_from_env() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .env("KLAVIYO_TOTP_SECRET", "JFC7FMIAQVM423A6")
        .arg("totp")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\d{6} ").unwrap());
}

#[test]
fn test_totp_without_secret_fails() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("totp")
        .assert()
        .failure()
        .stderr(predicate::str::contains("KLAVIYO_TOTP_SECRET"));
}

#[test]
fn test_totp_rejects_bad_secret() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["totp", "--secret", "not base32!"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid TOTP secret"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_project_config_supplies_totp_secret() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("klaviyo-relay.toml"),
        "[klaviyo]\ntotp_secret = \"JFC7FMIAQVM423A6\"\n",
    )
    .unwrap();

    relay(&dir)
        .arg("totp")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\d{6} ").unwrap());
}

#[test]
fn test_explicit_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["--config", "nope.toml", "totp", "--secret", "JFC7FMIAQVM423A6"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.toml"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy Management
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_status_reports_unreachable_relay() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["--relay", DEAD_RELAY, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unreachable"))
        .stdout(predicate::str::contains("missing"));
}

#[test]
fn test_status_json_reports_missing_store() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("session.json");
    relay(&dir)
        .args(["--json", "--relay", DEAD_RELAY, "status", "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"relayError\""))
        .stdout(predicate::str::contains("\"exists\": false"));
}

#[test]
fn test_status_flags_corrupt_store() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("session.json");
    std::fs::write(&store, "{ not json").unwrap();

    relay(&dir)
        .args(["--relay", DEAD_RELAY, "status", "--store"])
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("unreadable"));
}

#[test]
fn test_reload_fails_without_relay() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["--relay", DEAD_RELAY, "reload"])
        .assert()
        .failure();
}

#[test]
fn test_save_fails_without_relay() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .args(["--relay", DEAD_RELAY, "save"])
        .assert()
        .failure();
}

#[test]
fn test_login_requires_credentials() {
    let dir = TempDir::new().unwrap();
    relay(&dir)
        .arg("login")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
