//! Purging files, deleting versions and retention.

use std::fs;

use strata_engine::testing::{same_content, TestEnvironment};
use strata_engine::{Controller, EngineError, FilesetStatus, PathFilter, RestoreRequest};

#[test]
fn test_purge_keeps_shared_blocks() {
    let env = TestEnvironment::new().unwrap();
    // exactly three 4 KiB blocks, all of which are also the head of g.bin
    let f = env.write_file("f.bin", 3 * 4096, 1).unwrap();
    let mut g_content = fs::read(&f).unwrap();
    let tail = env.write_file("tail.tmp", 2 * 4096, 2).unwrap();
    g_content.extend(fs::read(&tail).unwrap());
    fs::remove_file(&tail).unwrap();
    env.write_bytes("g.bin", &g_content).unwrap();

    let controller = Controller::open(env.options()).unwrap();
    let backup = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(backup.new_blocks, 5);

    let purged = controller
        .purge_files(&PathFilter::including([env.catalog_key("f.bin")]), None)
        .unwrap();
    assert_eq!(purged.removed_file_count, 1);
    assert_eq!(purged.removed_size, 0);
    assert_eq!(purged.rewritten_file_lists, 1);
    assert_eq!(purged.deleted_volumes, 0);

    let files = controller.list_files(None, &PathFilter::all()).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, env.catalog_key("g.bin"));
    assert_eq!(controller.list().unwrap()[0].status, FilesetStatus::Full);

    controller
        .restore(&RestoreRequest::new().target(&env.restore_dir))
        .unwrap();
    assert!(same_content(&env.source_dir.join("g.bin"), &env.restore_dir.join("g.bin")).unwrap());
}

#[test]
fn test_purge_counts_unique_bytes() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("keep.bin", 9_000, 3).unwrap();
    env.write_file("secret.bin", 6_000, 4).unwrap();

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    let purged = controller
        .purge_files(&PathFilter::including(["*/secret.bin"]), None)
        .unwrap();
    // present in both versions, only the second purge frees its blocks
    assert_eq!(purged.removed_file_count, 2);
    assert_eq!(purged.removed_size, 6_000);
    assert_eq!(purged.rewritten_file_lists, 2);

    for version in [0, 1] {
        let files = controller.list_files(Some(version), &PathFilter::all()).unwrap();
        assert_eq!(files.len(), 1);
    }
}

#[test]
fn test_purge_limited_to_versions() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 2_000, 5).unwrap();

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    let purged = controller
        .purge_files(&PathFilter::including(["*/a.bin"]), Some(&[0][..]))
        .unwrap();
    assert_eq!(purged.removed_file_count, 1);
    assert_eq!(purged.removed_size, 0);
    assert!(controller.list_files(Some(0), &PathFilter::all()).unwrap().is_empty());
    assert_eq!(controller.list_files(Some(1), &PathFilter::all()).unwrap().len(), 1);
}

#[test]
fn test_purge_requires_patterns() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 2_000, 6).unwrap();
    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    assert!(matches!(
        controller.purge_files(&PathFilter::all(), None),
        Err(EngineError::InvalidRequest(_))
    ));
    assert!(matches!(
        controller.purge_files(&PathFilter::including(["*"]), Some(&[7][..])),
        Err(EngineError::InvalidRequest(_))
    ));
}

#[test]
fn test_delete_version_removes_unique_volumes() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 20_000, 7).unwrap();

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();
    env.write_file("a.bin", 21_000, 8).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();
    let before = env.remote_files().unwrap().len();

    let deleted = controller.delete_version(0).unwrap();
    assert_eq!(deleted.deleted_versions, vec![0]);
    assert_eq!(deleted.deleted_volumes, 1);
    // one volume and one file list gone
    assert_eq!(env.remote_files().unwrap().len(), before - 2);

    let versions = controller.list().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 1);
    assert!(matches!(
        controller.delete_version(0),
        Err(EngineError::InvalidRequest(_))
    ));
}

#[test]
fn test_retention_after_backup() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 5_000, 9).unwrap();
    env.write_file("b.bin", 5_000, 10).unwrap();
    env.write_file("c.bin", 5_000, 11).unwrap();

    let controller = Controller::open(env.options().with_keep_versions(1)).unwrap();
    let first = controller.backup(&[&env.source_dir]).unwrap();
    assert!(first.deleted_versions.is_empty());

    let second = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(second.deleted_versions, vec![0]);

    // a partial version is kept until a newer full one exists
    let control = controller.task_control();
    controller.set_unit_observer(move |_| control.stop());
    let partial = controller.backup(&[&env.source_dir]).unwrap();
    controller.clear_unit_observer();
    assert_eq!(partial.status, FilesetStatus::Partial);
    assert!(partial.deleted_versions.is_empty());
    let statuses: Vec<_> = controller.list().unwrap().iter().map(|v| (v.version, v.status)).collect();
    assert_eq!(statuses, vec![(1, FilesetStatus::Full), (2, FilesetStatus::Partial)]);

    let full = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(full.deleted_versions, vec![1, 2]);
    assert_eq!(controller.list().unwrap().len(), 1);

    let nothing = controller.delete().unwrap();
    assert!(nothing.deleted_versions.is_empty());

    controller
        .restore(&RestoreRequest::new().target(&env.restore_dir))
        .unwrap();
    assert!(same_content(&env.source_dir.join("c.bin"), &env.restore_dir.join("c.bin")).unwrap());
}

#[test]
fn test_delete_without_policy_is_noop() {
    let env = TestEnvironment::new().unwrap();
    env.write_file("a.bin", 1_000, 12).unwrap();
    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    let result = controller.delete().unwrap();
    assert!(result.deleted_versions.is_empty());
    assert_eq!(controller.list().unwrap().len(), 2);
}
