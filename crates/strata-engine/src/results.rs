//! Per-operation result reports.

use std::time::Duration;

use serde::Serialize;

use strata_catalog::FilesetStatus;

use crate::control::OperationState;
use crate::log_router::{LogEntry, LogLevel};

/// Outcome shared by every operation: final state plus separate error and
/// warning collections. A clean run has both empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    #[serde(serialize_with = "serialize_state")]
    pub state: OperationState,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

fn serialize_state<S: serde::Serializer>(state: &OperationState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// File a routed entry under errors or warnings by its level.
    pub(crate) fn record(&mut self, entry: &LogEntry) {
        match entry.level {
            LogLevel::Error => self.errors.push(entry.formatted()),
            LogLevel::Warning => self.warnings.push(entry.formatted()),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupResults {
    pub report: Report,
    pub version: u64,
    pub status: FilesetStatus,
    pub examined_files: u64,
    pub added_files: u64,
    pub modified_files: u64,
    pub unchanged_files: u64,
    pub failed_files: u64,
    pub size_of_examined: u64,
    pub uploaded_volumes: u64,
    pub uploaded_bytes: u64,
    pub new_blocks: u64,
    pub deduplicated_blocks: u64,
    /// Versions removed by retention after this backup.
    pub deleted_versions: Vec<u64>,
}

impl BackupResults {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            report: Report::default(),
            version,
            status: FilesetStatus::InProgress,
            examined_files: 0,
            added_files: 0,
            modified_files: 0,
            unchanged_files: 0,
            failed_files: 0,
            size_of_examined: 0,
            uploaded_volumes: 0,
            uploaded_bytes: 0,
            new_blocks: 0,
            deduplicated_blocks: 0,
            deleted_versions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreResults {
    pub report: Report,
    pub version: u64,
    pub restored_files: u64,
    pub restored_bytes: u64,
    /// Existing files left alone because overwrite was off.
    pub skipped_files: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeResults {
    pub report: Report,
    pub rewritten_file_lists: u64,
    pub removed_file_count: u64,
    /// Bytes of blocks whose last reference was dropped.
    pub removed_size: u64,
    pub deleted_volumes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteResults {
    pub report: Report,
    pub deleted_versions: Vec<u64>,
    pub deleted_volumes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairResults {
    pub report: Report,
    /// Versions rebuilt from remote file lists.
    pub recreated_versions: Vec<u64>,
    pub imported_volumes: u64,
    /// File lists that were missing remotely and uploaded again.
    pub uploaded_file_lists: u64,
}
