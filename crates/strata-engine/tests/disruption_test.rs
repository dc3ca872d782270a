//! Cooperative stop and hard abort in the middle of an operation.

use std::collections::BTreeSet;
use std::fs;

use strata_engine::testing::TestEnvironment;
use strata_engine::{
    Controller, EngineError, FilesetStatus, OperationState, RemoteFileKind, RestoreRequest,
};

/// Three files, large enough to fill several 64 KiB volumes.
fn write_sources(env: &TestEnvironment, seed: u64) -> Vec<Vec<u8>> {
    ["f10.bin", "f20.bin", "f30.bin"]
        .iter()
        .zip([40_000usize, 80_000, 120_000])
        .enumerate()
        .map(|(i, (name, size))| {
            let path = env.write_file(name, size, seed + i as u64).unwrap();
            fs::read(path).unwrap()
        })
        .collect()
}

fn stop_after_first_unit(controller: &Controller) {
    let control = controller.task_control();
    controller.set_unit_observer(move |_| control.stop());
}

#[test]
fn test_stop_commits_partial_version() {
    let env = TestEnvironment::new().unwrap();
    let originals = write_sources(&env, 100);

    let controller = Controller::open(env.options()).unwrap();
    let first = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(first.status, FilesetStatus::Full);
    assert!(first.uploaded_volumes > 1);

    let updated = write_sources(&env, 200);
    stop_after_first_unit(&controller);
    let second = controller.backup(&[&env.source_dir]).unwrap();
    controller.clear_unit_observer();

    assert_eq!(second.version, 1);
    assert_eq!(second.status, FilesetStatus::Partial);
    assert_eq!(second.examined_files, 1);
    assert!(second.report.errors.is_empty());
    assert_eq!(second.report.warnings.len(), 1);
    assert_eq!(second.report.state, OperationState::Stopped);
    assert_eq!(controller.state(), OperationState::Stopped);

    let versions = controller.list().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].status, FilesetStatus::Full);
    assert_eq!(versions[0].file_count, 3);
    assert_eq!(versions[1].status, FilesetStatus::Partial);
    assert_eq!(versions[1].file_count, 1);

    // the partial version restores what it recorded
    let partial_dir = env.restore_dir.join("partial");
    let restored = controller
        .restore(&RestoreRequest::new().version(1).target(&partial_dir))
        .unwrap();
    assert_eq!(restored.restored_files, 1);
    assert_eq!(fs::read(partial_dir.join("f10.bin")).unwrap(), updated[0]);

    // the earlier full version is untouched
    let full_dir = env.restore_dir.join("full");
    controller
        .restore(&RestoreRequest::new().version(0).target(&full_dir))
        .unwrap();
    for (name, content) in ["f10.bin", "f20.bin", "f30.bin"].iter().zip(&originals) {
        assert_eq!(&fs::read(full_dir.join(name)).unwrap(), content);
    }

    // a partial version still publishes its file list
    let lists: Vec<u64> = controller
        .list_remote()
        .unwrap()
        .into_iter()
        .filter_map(|f| match f.kind {
            RemoteFileKind::FileList { version, .. } => Some(version),
            _ => None,
        })
        .collect();
    assert_eq!(lists, vec![0, 1]);
}

#[test]
fn test_stop_signal_resets_for_next_operation() {
    let env = TestEnvironment::new().unwrap();
    write_sources(&env, 300);

    let controller = Controller::open(env.options()).unwrap();
    stop_after_first_unit(&controller);
    let stopped = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(stopped.status, FilesetStatus::Partial);
    controller.clear_unit_observer();

    let next = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(next.status, FilesetStatus::Full);
    assert_eq!(next.examined_files, 3);
    assert_eq!(next.unchanged_files, 1);
    assert_eq!(next.added_files, 2);
}

#[test]
fn test_stale_stop_request_is_cleared() {
    let env = TestEnvironment::new().unwrap();
    write_sources(&env, 400);

    let controller = Controller::open(env.options()).unwrap();
    // a stop requested while idle is cleared when the next operation begins
    controller.task_control().stop();
    let result = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(result.status, FilesetStatus::Full);
}

#[test]
fn test_abort_leaves_nothing_committed() {
    let env = TestEnvironment::new().unwrap();
    write_sources(&env, 500);

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    write_sources(&env, 600);
    let control = controller.task_control();
    controller.set_unit_observer(move |_| control.abort());
    let aborted = controller.backup(&[&env.source_dir]);
    controller.clear_unit_observer();

    assert!(matches!(aborted, Err(EngineError::Aborted)));
    assert_eq!(controller.state(), OperationState::Failed);
    let versions = controller.list().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 0);
    assert_eq!(controller.catalog().interrupted_versions().unwrap(), vec![1]);

    // the next backup cleans up the interrupted version first
    let next = controller.backup(&[&env.source_dir]).unwrap();
    assert_eq!(next.version, 2);
    assert_eq!(next.status, FilesetStatus::Full);
    assert!(controller.catalog().interrupted_versions().unwrap().is_empty());
    assert!(next.report.errors.is_empty());

    let catalog_volumes: BTreeSet<String> = controller
        .catalog()
        .volumes()
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    let remote_volumes: BTreeSet<String> = controller
        .list_remote()
        .unwrap()
        .into_iter()
        .filter_map(|f| match f.kind {
            RemoteFileKind::Volume { volume } => Some(volume),
            _ => None,
        })
        .collect();
    assert_eq!(catalog_volumes, remote_volumes);
}

#[test]
fn test_reopen_after_abort_recovers() {
    let env = TestEnvironment::new().unwrap();
    write_sources(&env, 700);

    {
        let controller = Controller::open(env.options()).unwrap();
        let control = controller.task_control();
        controller.set_unit_observer(move |_| control.abort());
        assert!(matches!(
            controller.backup(&[&env.source_dir]),
            Err(EngineError::Aborted)
        ));
    }

    let controller = Controller::open(env.options()).unwrap();
    assert!(controller.catalog().interrupted_versions().unwrap().is_empty());
    assert!(controller.catalog().pending_volumes().unwrap().is_empty());
    assert!(controller.list().unwrap().is_empty());
    assert!(controller
        .list_remote()
        .unwrap()
        .iter()
        .all(|f| !matches!(f.kind, RemoteFileKind::Volume { .. })));
}

#[test]
fn test_stop_during_restore() {
    let env = TestEnvironment::new().unwrap();
    write_sources(&env, 800);

    let controller = Controller::open(env.options()).unwrap();
    controller.backup(&[&env.source_dir]).unwrap();

    stop_after_first_unit(&controller);
    let restored = controller
        .restore(&RestoreRequest::new().target(&env.restore_dir))
        .unwrap();
    controller.clear_unit_observer();

    assert_eq!(restored.restored_files, 1);
    assert_eq!(restored.report.state, OperationState::Stopped);
    assert_eq!(restored.report.warnings.len(), 1);
    assert!(env.restore_dir.join("f10.bin").exists());
    assert!(!env.restore_dir.join("f20.bin").exists());
}
