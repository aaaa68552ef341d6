//! Tests for configuration resolution and graceful degradation
//!
//! Covers:
//! - Missing config files do not abort startup (defaults + warning)
//! - Priority order CLI argument > environment variable > per-user file
//! - Malformed or out-of-range files are reported as errors
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate SETLIST_CONFIG are marked with #[serial].

use serial_test::serial;
use setlist_common::config::{resolve_config_path, ComposerConfig, CONFIG_ENV_VAR};
use setlist_common::Error;
use std::env;
use std::fs;
use tempfile::TempDir;

fn write_config(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
#[serial]
fn test_env_var_names_config_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "env.toml", "[sync]\nretry_budget_ms = 1234\n");
    env::set_var(CONFIG_ENV_VAR, &path);

    let config = ComposerConfig::load(None).unwrap();
    assert_eq!(config.sync.retry_budget_ms, 1234);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_cli_arg_overrides_env_var() {
    let dir = TempDir::new().unwrap();
    let env_path = write_config(&dir, "env.toml", "[availability]\nwindow_days = 10\n");
    let cli_path = write_config(&dir, "cli.toml", "[availability]\nwindow_days = 14\n");
    env::set_var(CONFIG_ENV_VAR, &env_path);

    assert_eq!(
        resolve_config_path(Some(&cli_path), CONFIG_ENV_VAR),
        Some(cli_path.clone())
    );
    let config = ComposerConfig::load(Some(&cli_path)).unwrap();
    assert_eq!(config.availability.window_days, 14);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_missing_env_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    env::set_var(CONFIG_ENV_VAR, dir.path().join("does-not-exist.toml"));

    let config = ComposerConfig::load(None).unwrap();
    assert_eq!(config, ComposerConfig::default());

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_missing_cli_file_is_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");

    let err = ComposerConfig::load(Some(&missing)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
#[serial]
fn test_invalid_file_reports_path() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "bad.toml", "[sync]\nsubmit_timeout_ms = 0\n");

    let err = ComposerConfig::load(Some(&path)).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("bad.toml"), "message was {message}");
    assert!(message.contains("submit_timeout_ms"));
}
