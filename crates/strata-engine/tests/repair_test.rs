//! Catalog rebuild and reconciliation against the remote.

use std::fs;

use strata_engine::testing::{same_content, TestEnvironment};
use strata_engine::{Controller, EngineError, FilesetStatus, RestoreRequest};

#[test]
fn test_recreate_catalog_from_remote() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 30_000, 1).unwrap();
    env.write_file("docs/b.bin", 70_000, 2).unwrap();

    {
        let controller = Controller::open(env.options()).unwrap();
        controller.backup(&[&env.source_dir]).unwrap();
        env.write_file("a.bin", 31_000, 3).unwrap();
        controller.backup(&[&env.source_dir]).unwrap();
    }

    let mut options = env.options();
    options.catalog_dir = env.catalog_dir_named("rebuilt").unwrap();
    let controller = Controller::open(options).unwrap();
    assert!(controller.list().unwrap().is_empty());

    let repaired = controller.repair().unwrap();
    assert_eq!(repaired.recreated_versions, vec![0, 1]);
    assert!(repaired.imported_volumes >= 2);
    assert!(repaired.report.is_clean());

    let versions = controller.list().unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.status == FilesetStatus::Full && v.file_count == 2));

    controller
        .restore(&RestoreRequest::new().target(&env.restore_dir))
        .unwrap();
    assert!(same_content(&env.source_dir.join("a.bin"), &env.restore_dir.join("a.bin")).unwrap());
    assert!(same_content(
        &env.source_dir.join("docs/b.bin"),
        &env.restore_dir.join("docs/b.bin")
    )
    .unwrap());

    // the rebuilt catalog keeps numbering and dedups against imported blocks
    let next = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(next.version, 2);
    assert_eq!(next.new_blocks, 0);
}

#[test]
fn test_recreate_with_wrong_passphrase_fails() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 5_000, 4).unwrap();
    {
        let controller = Controller::open(env.options()).unwrap();
        controller.backup(&[&env.source_dir]).unwrap();
    }

    let mut options = env.options().with_passphrase("not the passphrase");
    options.catalog_dir = env.catalog_dir_named("intruder").unwrap();
    let controller = Controller::open(options).unwrap();
    assert!(matches!(controller.repair(), Err(EngineError::Authentication(_))));
    assert!(controller.list().unwrap().is_empty());
}

#[test]
fn test_reconcile_uploads_missing_file_list() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 5_000, 5).unwrap();

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    let list_name = env
        .remote_files()
        .unwrap()
        .into_iter()
        .find(|n| n.contains(".dlist"))
        .unwrap();
    fs::remove_file(env.target_dir.join(&list_name)).unwrap();

    let repaired = controller.repair().unwrap();
    assert_eq!(repaired.uploaded_file_lists, 1);
    assert!(repaired.report.is_clean());
    assert!(env.remote_files().unwrap().contains(&list_name));

    let again = controller.repair().unwrap();
    assert_eq!(again.uploaded_file_lists, 0);
}

#[test]
fn test_reconcile_reports_missing_and_unknown_volumes() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 5_000, 6).unwrap();

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    let volume = env
        .remote_files()
        .unwrap()
        .into_iter()
        .find(|n| n.contains(".dblock"))
        .unwrap();
    // same shape, different id: "strata-b" + 32 hex digits
    let stray = format!("{}ffff{}", &volume[..8], &volume[12..]);
    fs::rename(env.target_dir.join(&volume), env.target_dir.join(&stray)).unwrap();

    let repaired = controller.repair().unwrap();
    assert_eq!(repaired.report.errors.len(), 1);
    assert_eq!(repaired.report.warnings.len(), 1);
    assert!(repaired.report.errors[0].contains("missing"));
    assert!(repaired.report.warnings[0].contains("not in the catalog"));
}
