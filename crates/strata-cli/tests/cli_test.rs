//! End-to-end runs of the strata binary against a local folder target.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

struct Workspace {
    _temp: TempDir,
    root: PathBuf,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let config = root.join("strata.toml");
        fs::write(
            &config,
            format!(
                r#"
[storage]
target = "file://{target}"
catalog = "{catalog}"

[backup]
block_size = "4kb"
volume_size = "64kb"

[encryption]
enabled = false
"#,
                target = root.join("target").display(),
                catalog = root.join("catalog").display(),
            ),
        )
        .unwrap();
        fs::create_dir_all(root.join("source/docs")).unwrap();
        Self {
            _temp: temp,
            root,
            config,
        }
    }

    fn source(&self) -> PathBuf {
        self.root.join("source")
    }

    fn strata(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_strata"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("STRATA_TARGET")
            .env_remove("STRATA_PREFIX")
            .env_remove("STRATA_CATALOG")
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to run strata")
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_config_show_outputs_toml() {
    let ws = Workspace::new();
    let output = ws.strata(&["config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("[storage]"));
    assert!(stdout.contains("[backup]"));
    assert!(stdout.contains("[retention]"));
    assert!(stdout.contains("block_size = \"4kb\""));
}

#[test]
fn test_config_path_reports_explicit_file() {
    let ws = Workspace::new();
    let output = ws.strata(&["config", "path"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("Explicit:"));
}

#[test]
fn test_backup_list_restore() {
    let ws = Workspace::new();
    fs::write(ws.source().join("docs/a.txt"), b"hello strata").unwrap();
    fs::write(ws.source().join("b.bin"), vec![7u8; 10_000]).unwrap();

    let backup = ws.strata(&["backup", path_arg(&ws.source())]);
    assert!(
        backup.status.success(),
        "{}",
        String::from_utf8_lossy(&backup.stderr)
    );

    let list = ws.strata(&["--json", "list"]);
    assert!(list.status.success());
    let versions: serde_json::Value = serde_json::from_slice(&list.stdout).unwrap();
    assert_eq!(versions.as_array().unwrap().len(), 1);
    assert_eq!(versions[0]["status"], "Full");
    assert_eq!(versions[0]["file_count"], 2);

    let restore_dir = ws.root.join("restored");
    let restore = ws.strata(&["restore", "--to", path_arg(&restore_dir)]);
    assert!(
        restore.status.success(),
        "{}",
        String::from_utf8_lossy(&restore.stderr)
    );
    assert_eq!(fs::read(restore_dir.join("docs/a.txt")).unwrap(), b"hello strata");
    assert_eq!(fs::read(restore_dir.join("b.bin")).unwrap(), vec![7u8; 10_000]);
}

#[test]
fn test_backup_results_as_json() {
    let ws = Workspace::new();
    fs::write(ws.source().join("a.txt"), b"one").unwrap();

    let output = ws.strata(&["--json", "backup", path_arg(&ws.source())]);
    assert!(output.status.success());
    let results: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results["version"], 0);
    assert_eq!(results["added_files"], 1);
    assert_eq!(results["report"]["state"], "completed");
    assert!(results["report"]["errors"].as_array().unwrap().is_empty());
}

#[test]
fn test_list_remote_classifies_files() {
    let ws = Workspace::new();
    fs::write(ws.source().join("a.txt"), b"remote").unwrap();
    assert!(ws.strata(&["backup", path_arg(&ws.source())]).status.success());

    let output = ws.strata(&["--json", "list-remote"]);
    assert!(output.status.success());
    let files: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let kinds: Vec<&str> = files
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["kind"]["type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"volume"));
    assert!(kinds.contains(&"file_list"));
}

#[test]
fn test_restore_without_backup_fails() {
    let ws = Workspace::new();
    let output = ws.strata(&["restore"]);
    assert!(!output.status.success());
}

#[test]
fn test_encryption_requires_passphrase() {
    let ws = Workspace::new();
    let config = fs::read_to_string(&ws.config)
        .unwrap()
        .replace("enabled = false", "enabled = true\npassphrase_env = \"STRATA_TEST_UNSET_PASSPHRASE\"");
    fs::write(&ws.config, config).unwrap();

    let output = ws.strata(&["list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("STRATA_TEST_UNSET_PASSPHRASE"));
}
