//! Purge of files from existing versions, and deletion of whole versions.
//!
//! Both only drop references; blocks go away with the sweep that follows,
//! and a volume is deleted remotely only once none of its blocks is live.

use chrono::Utc;
use tracing::instrument;

use strata_config::log_engine_info;

use crate::controller::Controller;
use crate::filter::PathFilter;
use crate::results::{DeleteResults, PurgeResults};
use crate::retention::select_versions_to_delete;
use crate::{EngineError, Result};

impl Controller {
    /// Remove files matching `filter` from `versions` (default: every
    /// committed version) and rewrite the touched file lists.
    ///
    /// `removed_size` counts only bytes no other file still references.
    /// A fileset keeps its Full or Partial status.
    #[instrument(skip(self, filter))]
    pub fn purge_files(&self, filter: &PathFilter, versions: Option<&[u64]>) -> Result<PurgeResults> {
        self.operate("Purge", || {
            if filter.include.is_empty() {
                return Err(EngineError::InvalidRequest(
                    "purge needs at least one path pattern".into(),
                ));
            }
            let targets: Vec<u64> = match versions {
                Some(v) => v.to_vec(),
                None => self.catalog.list_versions()?.iter().map(|f| f.version).collect(),
            };

            let mut results = PurgeResults::default();
            for version in targets {
                self.resolve_version(Some(version))?;
                let outcome = self.catalog.purge_files(version, |p| filter.matches(p))?;
                if outcome.removed_paths.is_empty() {
                    continue;
                }
                results.removed_file_count += outcome.removed_paths.len() as u64;
                results.removed_size += outcome.removed_size;
                self.publish_file_list(version)?;
                results.rewritten_file_lists += 1;
                log_engine_info!(
                    "purged version",
                    version = version,
                    files = outcome.removed_paths.len(),
                    removed_size = outcome.removed_size
                );
            }
            results.deleted_volumes = self.sweep_and_delete(&mut results.report)?;
            Ok(results)
        })
    }

    /// Delete one committed version.
    #[instrument(skip(self))]
    pub fn delete_version(&self, version: u64) -> Result<DeleteResults> {
        self.operate("Delete", || {
            self.resolve_version(Some(version))?;
            let mut results = DeleteResults::default();
            self.remove_version(version)?;
            results.deleted_versions.push(version);
            results.deleted_volumes = self.sweep_and_delete(&mut results.report)?;
            Ok(results)
        })
    }

    /// Delete the versions the configured retention policy no longer keeps.
    #[instrument(skip(self))]
    pub fn delete(&self) -> Result<DeleteResults> {
        self.operate("Delete", || {
            let mut results = DeleteResults::default();
            results.deleted_versions = self.apply_retention()?;
            results.deleted_volumes = self.sweep_and_delete(&mut results.report)?;
            Ok(results)
        })
    }

    /// Remove what retention selects. The caller sweeps.
    pub(crate) fn apply_retention(&self) -> Result<Vec<u64>> {
        if !self.options.has_retention() {
            return Ok(Vec::new());
        }
        let filesets = self.catalog.list_versions()?;
        let doomed = select_versions_to_delete(
            &filesets,
            self.options.keep_versions,
            self.options.keep_time,
            Utc::now(),
        );
        for version in &doomed {
            self.remove_version(*version)?;
        }
        if !doomed.is_empty() {
            log_engine_info!("retention removed versions", count = doomed.len());
        }
        Ok(doomed)
    }

    fn remove_version(&self, version: u64) -> Result<()> {
        let record = self
            .catalog
            .get_version(version)?
            .ok_or_else(|| EngineError::InvalidRequest(format!("no version {version}")))?;
        self.catalog.delete_version(version)?;
        self.remote.delete_file_list(version, record.created)?;
        Ok(())
    }

    pub(crate) fn publish_file_list(&self, version: u64) -> Result<String> {
        let record = self
            .catalog
            .get_version(version)?
            .ok_or_else(|| EngineError::InvalidRequest(format!("no version {version}")))?;
        let files = self.catalog.list_files(version, |_| true)?;
        self.remote.put_file_list(&record, &files)
    }
}
