//! Reconcile the catalog with the remote.
//!
//! With an empty catalog the remote is the source of truth: volumes are
//! re-indexed from their own headers and every version is rebuilt from its
//! file list. Otherwise the catalog is the source of truth and missing file
//! lists are uploaded again.

use std::collections::{HashMap, HashSet};

use tracing::instrument;

use strata_config::log_engine_info;

use crate::controller::{message_ids, Controller};
use crate::log_router::{LogEntry, LogLevel};
use crate::remote::{RemoteFile, RemoteFileKind};
use crate::results::RepairResults;
use crate::Result;

const TAG: &str = "Repair";

impl Controller {
    #[instrument(skip(self))]
    pub fn repair(&self) -> Result<RepairResults> {
        self.operate("Repair", || {
            let remote = self.remote.list()?;
            if self.catalog.is_empty()? {
                self.recreate(&remote)
            } else {
                self.reconcile(&remote)
            }
        })
    }

    fn recreate(&self, remote: &[RemoteFile]) -> Result<RepairResults> {
        let mut results = RepairResults::default();

        for file in remote {
            if let RemoteFileKind::Volume { volume } = &file.kind {
                let reader = self.remote.get_volume(volume)?;
                let blocks: Vec<_> = reader
                    .entries()
                    .iter()
                    .map(|e| (e.digest, e.length))
                    .collect();
                self.catalog.import_volume(volume, file.size, &blocks)?;
                results.imported_volumes += 1;
            }
        }

        let mut lists: Vec<(u64, &RemoteFile)> = remote
            .iter()
            .filter_map(|f| match f.kind {
                RemoteFileKind::FileList { version, .. } => Some((version, f)),
                _ => None,
            })
            .collect();
        lists.sort_by_key(|(version, _)| *version);

        for (version, file) in lists {
            let (record, files) = self.remote.get_file_list(&file.name)?.into_records()?;
            self.catalog.import_fileset(record, files)?;
            results.recreated_versions.push(version);
        }

        if !results.recreated_versions.is_empty() {
            self.sweep_and_delete(&mut results.report)?;
        }
        log_engine_info!(
            "catalog recreated",
            versions = results.recreated_versions.len(),
            volumes = results.imported_volumes
        );
        Ok(results)
    }

    fn reconcile(&self, remote: &[RemoteFile]) -> Result<RepairResults> {
        let mut results = RepairResults::default();

        let lists: HashSet<u64> = remote
            .iter()
            .filter_map(|f| match f.kind {
                RemoteFileKind::FileList { version, .. } => Some(version),
                _ => None,
            })
            .collect();
        for fileset in self.catalog.list_versions()? {
            if !lists.contains(&fileset.version) {
                self.publish_file_list(fileset.version)?;
                results.uploaded_file_lists += 1;
            }
        }

        let remote_volumes: HashMap<&str, &RemoteFile> = remote
            .iter()
            .filter_map(|f| match &f.kind {
                RemoteFileKind::Volume { volume } => Some((volume.as_str(), f)),
                _ => None,
            })
            .collect();
        let mut known = HashSet::new();
        for volume in self.catalog.volumes()? {
            known.insert(volume.name.clone());
            if volume.state.is_durable() && !remote_volumes.contains_key(volume.name.as_str()) {
                self.emit(
                    &mut results.report,
                    LogEntry::new(
                        LogLevel::Error,
                        TAG,
                        message_ids::MISSING_VOLUME,
                        "volume {0} is missing from the remote",
                    )
                    .with_args([volume.name.as_str()]),
                );
            }
        }
        let mut unknown: Vec<&str> = remote_volumes
            .keys()
            .copied()
            .filter(|name| !known.contains(*name))
            .collect();
        unknown.sort_unstable();
        for name in unknown {
            self.emit(
                &mut results.report,
                LogEntry::new(
                    LogLevel::Warning,
                    TAG,
                    message_ids::UNKNOWN_VOLUME,
                    "remote volume {0} is not in the catalog",
                )
                .with_args([name]),
            );
        }
        Ok(results)
    }
}
