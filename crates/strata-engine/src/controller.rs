//! The operation controller: one catalog, one remote, one operation at a
//! time.
//!
//! Operations take `&self` so a [`TaskControl`] handle (or another
//! thread) can stop them while they run; an internal guard serialises
//! the operations themselves.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use tracing::instrument;

use strata_catalog::{Catalog, FileRecord, FilesetRecord};
use strata_config::{log_engine_debug, log_engine_info, log_engine_warn};
use strata_crypto::PassphraseCipher;

use crate::backend::open_backend;
use crate::control::{OperationState, TaskControl};
use crate::filter::PathFilter;
use crate::lock::CatalogLock;
use crate::log_router::{LogDestination, LogEntry, LogFilter, LogLevel, LogRouter, TracingDestination};
use crate::options::Options;
use crate::remote::{RemoteFile, RemoteStore};
use crate::results::Report;
use crate::{EngineError, Result};

/// Called with the path of every finished unit of work.
pub type UnitObserver = Arc<dyn Fn(&Path) + Send + Sync>;

/// Message ids used in routed log entries.
pub mod message_ids {
    pub const BACKUP_STOPPED_EARLY: &str = "BackupStoppedEarly";
    pub const FILE_FAILED: &str = "FileFailed";
    pub const RESTORE_FAILED: &str = "RestoreFailed";
    pub const RESTORE_SKIPPED: &str = "RestoreSkipped";
    pub const RESTORE_STOPPED_EARLY: &str = "RestoreStoppedEarly";
    pub const INTERRUPTED_ROLLBACK: &str = "InterruptedBackupRolledBack";
    pub const VOLUME_DELETE_FAILED: &str = "VolumeDeleteFailed";
    pub const FILE_LIST_UPLOAD_FAILED: &str = "FileListUploadFailed";
    pub const MISSING_VOLUME: &str = "MissingRemoteVolume";
    pub const UNKNOWN_VOLUME: &str = "UnknownRemoteVolume";
    pub const OPERATION_FAILED: &str = "OperationFailed";
}

pub(crate) trait HasReport {
    fn report_mut(&mut self) -> &mut Report;
}

macro_rules! impl_has_report {
    ($($ty:ty),*) => {
        $(impl HasReport for $ty {
            fn report_mut(&mut self) -> &mut Report {
                &mut self.report
            }
        })*
    };
}

impl_has_report!(
    crate::results::BackupResults,
    crate::results::RestoreResults,
    crate::results::PurgeResults,
    crate::results::DeleteResults,
    crate::results::RepairResults
);

pub struct Controller {
    pub(crate) options: Options,
    pub(crate) catalog: Catalog,
    pub(crate) remote: RemoteStore,
    router: LogRouter,
    control: TaskControl,
    observer: RwLock<Option<UnitObserver>>,
    op_guard: Mutex<()>,
    _lock: CatalogLock,
}

impl Controller {
    /// Open the catalog in `options.catalog_dir` and connect to the target.
    ///
    /// Fails with [`EngineError::Locked`] if another process holds the
    /// catalog. Backups left in progress by a crash or hard abort are rolled
    /// back before this returns.
    #[instrument(skip(options), fields(target = %options.target, prefix = %options.prefix))]
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        let lock = CatalogLock::acquire(&options.catalog_dir, options.lock_timeout)?;
        let catalog = Catalog::open(options.catalog_dir.join("catalog.lmdb"))?;

        let backend = open_backend(&options.target)?;
        let cipher = options
            .passphrase
            .as_deref()
            .map(|p| PassphraseCipher::with_params(p, options.kdf))
            .transpose()?
            .map(Arc::new);
        let remote = RemoteStore::new(backend, cipher, options.retry, options.prefix.clone());

        let router = LogRouter::new();
        router.add_target_with_suppression(
            Some(Arc::new(TracingDestination) as Arc<dyn LogDestination>),
            LogLevel::Information,
            None,
            options.suppress_warnings.iter().cloned(),
        );

        let controller = Self {
            options,
            catalog,
            remote,
            router,
            control: TaskControl::new(),
            observer: RwLock::new(None),
            op_guard: Mutex::new(()),
            _lock: lock,
        };

        let mut report = Report::default();
        controller.recover(&mut report)?;
        log_engine_info!(
            "controller ready",
            target = controller.options.target.as_str(),
            encrypted = controller.remote.is_encrypted()
        );
        Ok(controller)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Handle for stopping or aborting the running (or next) operation.
    pub fn task_control(&self) -> TaskControl {
        self.control.clone()
    }

    pub fn state(&self) -> OperationState {
        self.control.state()
    }

    /// Register a callback run after each completed unit of work.
    pub fn set_unit_observer<F>(&self, observer: F)
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    pub fn clear_unit_observer(&self) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Add a log destination next to the default tracing one.
    pub fn add_log_target(
        &self,
        destination: Option<Arc<dyn LogDestination>>,
        minimum: LogLevel,
        filter: Option<LogFilter>,
        suppressed: &[String],
    ) {
        self.router
            .add_target_with_suppression(destination, minimum, filter, suppressed.iter().cloned());
    }

    /// Committed versions, oldest first.
    pub fn list(&self) -> Result<Vec<FilesetRecord>> {
        Ok(self.catalog.list_versions()?)
    }

    /// Files of `version` (default: newest) selected by `filter`.
    pub fn list_files(&self, version: Option<u64>, filter: &PathFilter) -> Result<Vec<FileRecord>> {
        let version = self.resolve_version(version)?;
        Ok(self.catalog.list_files(version, |p| filter.matches(p))?)
    }

    /// Remote files written under this configuration's prefix.
    pub fn list_remote(&self) -> Result<Vec<RemoteFile>> {
        self.remote.list()
    }

    pub(crate) fn resolve_version(&self, version: Option<u64>) -> Result<u64> {
        match version {
            Some(v) => match self.catalog.get_version(v)? {
                Some(record) if record.status.is_committed() => Ok(v),
                _ => Err(EngineError::InvalidRequest(format!("no committed version {v}"))),
            },
            None => self
                .catalog
                .latest_committed()?
                .map(|r| r.version)
                .ok_or_else(|| EngineError::InvalidRequest("no committed backup yet".into())),
        }
    }

    /// Run one operation: serialise, reset the signal, time it, and settle
    /// the final state.
    pub(crate) fn operate<T, F>(&self, name: &'static str, f: F) -> Result<T>
    where
        T: HasReport,
        F: FnOnce() -> Result<T>,
    {
        let _guard = self.guard();
        self.control.begin();
        let started = Instant::now();
        log_engine_debug!("operation started", operation = name);

        match f() {
            Ok(mut results) => {
                let report = results.report_mut();
                report.duration = started.elapsed();
                if matches!(report.state, OperationState::Idle | OperationState::Running) {
                    report.state = OperationState::Completed;
                }
                self.control.finish(report.state);
                log_engine_info!(
                    "operation finished",
                    operation = name,
                    state = tracing::field::display(report.state),
                    errors = report.errors.len(),
                    warnings = report.warnings.len()
                );
                Ok(results)
            }
            Err(e) => {
                self.control.finish(OperationState::Failed);
                let entry = LogEntry::new(
                    LogLevel::Error,
                    name,
                    message_ids::OPERATION_FAILED,
                    "{0} failed: {1}",
                )
                .with_args([name.to_string(), e.to_string()]);
                self.router.write_message(&entry);
                Err(e)
            }
        }
    }

    /// Route `entry` and file it in `report`.
    pub(crate) fn emit(&self, report: &mut Report, entry: LogEntry) {
        self.router.write_message(&entry);
        report.record(&entry);
    }

    pub(crate) fn notify_unit(&self, path: &Path) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(path);
        }
    }

    pub(crate) fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Roll back filesets a previous run left in progress.
    pub(crate) fn recover(&self, report: &mut Report) -> Result<()> {
        let interrupted = self.catalog.interrupted_versions()?;
        for version in &interrupted {
            let outcome = self.catalog.delete_version(*version)?;
            self.emit(
                report,
                LogEntry::new(
                    LogLevel::Information,
                    "Recovery",
                    message_ids::INTERRUPTED_ROLLBACK,
                    "rolled back interrupted backup version {0} ({1} files)",
                )
                .with_args([version.to_string(), outcome.removed_files.to_string()]),
            );
        }
        if !interrupted.is_empty() || !self.catalog.pending_volumes()?.is_empty() {
            self.sweep_and_delete(report)?;
        }
        Ok(())
    }

    /// Sweep volumes with no live block and delete them remotely.
    ///
    /// A volume whose remote delete fails stays marked for deletion and is
    /// retried by the next sweep. Returns the number of volumes deleted.
    pub(crate) fn sweep_and_delete(&self, report: &mut Report) -> Result<u64> {
        let swept = self.catalog.sweep_unreferenced()?;
        let mut deleted = 0;
        for volume in swept {
            match self.remote.delete_volume(&volume.name) {
                Ok(()) => {
                    self.catalog.forget_volume(&volume.name)?;
                    deleted += 1;
                }
                Err(e @ EngineError::Authentication(_)) => return Err(e),
                Err(e) => {
                    log_engine_warn!("volume delete failed", volume = volume.name.as_str());
                    self.emit(
                        report,
                        LogEntry::new(
                            LogLevel::Warning,
                            "Sweep",
                            message_ids::VOLUME_DELETE_FAILED,
                            "could not delete volume {0}: {1}",
                        )
                        .with_args([volume.name.clone(), e.to_string()]),
                    );
                }
            }
        }
        Ok(deleted)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.op_guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
