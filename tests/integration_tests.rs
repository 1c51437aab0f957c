//! Integration tests for the agencyhub CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create an agencyhub Command with no inherited overrides
fn agencyhub() -> Command {
    let mut cmd = cargo_bin_cmd!("agencyhub");
    cmd.env_remove("AGENCYHUB_PORT")
        .env_remove("AGENCYHUB_DB_PATH")
        .env_remove("AGENCYHUB_LOG_JSON")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        agencyhub()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_version() {
        agencyhub()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_command_fails() {
        agencyhub().arg("launch").assert().failure();
    }
}

// =============================================================================
// Init
// =============================================================================

mod init {
    use super::*;

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = create_temp_project();

        agencyhub()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized agencyhub database"));

        assert!(dir.path().join(".agencyhub/agencyhub.toml").exists());
        assert!(dir.path().join(".agencyhub/agencyhub.db").exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = create_temp_project();
        agencyhub().current_dir(dir.path()).arg("init").assert().success();

        agencyhub()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Using existing config"));
    }

    #[test]
    fn test_init_with_project_dir_and_db_path() {
        let dir = create_temp_project();

        agencyhub()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["init", "--db-path", "data/hub.db"])
            .assert()
            .success();

        assert!(dir.path().join("data/hub.db").exists());
        let content = fs::read_to_string(dir.path().join(".agencyhub/agencyhub.toml")).unwrap();
        assert!(content.contains("data/hub.db"));
    }
}

// =============================================================================
// Config
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_without_file_uses_defaults() {
        let dir = create_temp_project();

        agencyhub()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No agencyhub.toml found"))
            .stdout(predicate::str::contains("port = 3141"));
    }

    #[test]
    fn test_config_init_then_show() {
        let dir = create_temp_project();

        agencyhub()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created agencyhub.toml"));

        agencyhub()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        agencyhub()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Config file:"))
            .stdout(predicate::str::contains("[server]"));
    }

    #[test]
    fn test_env_override_shows_in_effective_config() {
        let dir = create_temp_project();

        agencyhub()
            .current_dir(dir.path())
            .env("AGENCYHUB_PORT", "4242")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4242"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = create_temp_project();
        let hub_dir = dir.path().join(".agencyhub");
        fs::create_dir_all(&hub_dir).unwrap();
        fs::write(
            hub_dir.join("agencyhub.toml"),
            "[server]\nport = 0\n\n[identity]\napi_url = \"ftp://nope\"\n",
        )
        .unwrap();

        agencyhub()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("server.port must be non-zero"))
            .stdout(predicate::str::contains("identity.api_url"));
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = create_temp_project();

        agencyhub()
            .current_dir(dir.path())
            .args(["--config", "missing.toml", "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Config file not found"));
    }

    #[test]
    fn test_serve_rejects_invalid_config() {
        let dir = create_temp_project();
        let hub_dir = dir.path().join(".agencyhub");
        fs::create_dir_all(&hub_dir).unwrap();
        fs::write(
            hub_dir.join("agencyhub.toml"),
            "[logging]\nfilter = \"agencyhub=loud\"\n",
        )
        .unwrap();

        agencyhub()
            .current_dir(dir.path())
            .arg("serve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}
