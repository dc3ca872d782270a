//! Integration tests for strata-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use std::time::Duration;
use strata_config::{Config, LogLevel};
use tempfile::tempdir;

#[test]
fn test_load_single_layer() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[storage]
target = "file:///srv/backups"
prefix = "workstation"
catalog = "/var/lib/strata"

[backup]
block_size = "1mb"
volume_size = "20mb"
upload_workers = 3

[retention]
keep_versions = 5
keep_time = "30d"

[logging]
level = "info"
suppress_warnings = ["BackupStoppedEarly"]
"#,
    )
    .unwrap();

    let config = Config::load_layers(&[path]).unwrap();
    assert_eq!(config.storage.target, "file:///srv/backups");
    assert_eq!(config.storage.prefix, "workstation");
    assert_eq!(config.storage.catalog_path(), PathBuf::from("/var/lib/strata"));
    assert_eq!(config.backup.block_size_bytes().unwrap(), 1024 * 1024);
    assert_eq!(config.backup.upload_workers(), 3);
    assert_eq!(config.retention.keep_versions, Some(5));
    assert_eq!(
        config.retention.keep_time().unwrap(),
        Some(Duration::from_secs(30 * 86400))
    );
    assert_eq!(config.logging.level, LogLevel::Info);
    assert_eq!(config.logging.suppress_warnings, vec!["BackupStoppedEarly"]);
    // Untouched sections keep their defaults.
    assert!(config.encryption.enabled);
    assert_eq!(config.retry.max_retries, 3);
}

#[test]
fn test_project_layer_overrides_per_key() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    let project = temp.path().join("project.toml");
    std::fs::write(
        &global,
        r#"
[storage]
target = "file:///mnt/nas"
prefix = "home"

[backup]
block_size = "64kb"
volume_size = "8mb"
"#,
    )
    .unwrap();
    std::fs::write(
        &project,
        r#"
[backup]
volume_size = "16mb"
"#,
    )
    .unwrap();

    let config = Config::load_layers(&[global, project]).unwrap();
    assert_eq!(config.storage.target, "file:///mnt/nas");
    assert_eq!(config.storage.prefix, "home");
    assert_eq!(config.backup.block_size, "64kb");
    assert_eq!(config.backup.volume_size, "16mb");
}

#[test]
fn test_missing_layers_fall_back_to_defaults() {
    let temp = tempdir().unwrap();
    let config = Config::load_layers(&[temp.path().join("nope.toml")]).unwrap();
    assert_eq!(config.storage.prefix, "strata");
}

#[test]
fn test_invalid_layer_is_an_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[backup]\nblock_size = \"0\"\n").unwrap();
    assert!(Config::load_layers(&[path]).is_err());
}

#[test]
fn test_load_file_requires_existing_file() {
    let temp = tempdir().unwrap();
    assert!(Config::load_file(&temp.path().join("missing.toml")).is_err());
}
