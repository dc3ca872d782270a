//! Restore files of one version from remote volumes.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tracing::instrument;

use strata_catalog::FileRecord;
use strata_config::{log_restore_debug, log_restore_info};
use strata_pack::VolumeReader;

use crate::backend::BackendError;
use crate::controller::{message_ids, Controller};
use crate::filter::PathFilter;
use crate::log_router::{LogEntry, LogLevel};
use crate::remote::RemoteStore;
use crate::results::RestoreResults;
use crate::{EngineError, OperationState, Result};

const TAG: &str = "Restore";
const CACHED_VOLUMES: usize = 4;

/// What to restore and where.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Defaults to the newest committed version.
    pub version: Option<u64>,
    pub paths: PathFilter,
    /// Restore below this directory instead of the original locations. The
    /// longest directory prefix shared by the selected files is dropped.
    pub target: Option<PathBuf>,
    /// Replace files that already exist.
    pub overwrite: bool,
}

impl RestoreRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn paths(mut self, paths: PathFilter) -> Self {
        self.paths = paths;
        self
    }

    pub fn target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl Controller {
    /// Restore the selected files. One file is one unit of work; a stop
    /// request is honoured between files.
    #[instrument(skip(self, request), fields(version = ?request.version))]
    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreResults> {
        self.operate("Restore", || self.run_restore(request))
    }

    fn run_restore(&self, request: &RestoreRequest) -> Result<RestoreResults> {
        let version = self.resolve_version(request.version)?;
        let files = self.catalog.list_files(version, |p| request.paths.matches(p))?;
        let base = match &request.target {
            Some(_) => common_directory(files.iter().map(|f| f.path.as_str())),
            None => PathBuf::new(),
        };

        let mut results = RestoreResults {
            version,
            ..RestoreResults::default()
        };
        let mut cache = VolumeCache::new(CACHED_VOLUMES);
        log_restore_info!("restore started", version = version, files = files.len());

        let control = self.control().clone();
        let mut stopped = false;
        for file in &files {
            if control.is_abort_requested() {
                return Err(EngineError::Aborted);
            }
            if control.should_stop() {
                stopped = true;
                break;
            }

            let dest = match destination(&file.path, request.target.as_deref(), &base) {
                Ok(dest) => dest,
                Err(e) => {
                    self.restore_failed(&mut results, &file.path, &e);
                    continue;
                }
            };
            if dest.exists() && !request.overwrite {
                results.skipped_files += 1;
                self.emit(
                    &mut results.report,
                    LogEntry::new(
                        LogLevel::Information,
                        TAG,
                        message_ids::RESTORE_SKIPPED,
                        "{0} exists, not overwritten",
                    )
                    .with_args([dest.display()]),
                );
                continue;
            }

            match self.restore_file(file, &dest, &mut cache) {
                Ok(bytes) => {
                    results.restored_files += 1;
                    results.restored_bytes += bytes;
                    log_restore_debug!("restored file", path = file.path.as_str(), bytes = bytes);
                    self.notify_unit(&dest);
                }
                Err(e) if is_file_scoped(&e) => self.restore_failed(&mut results, &file.path, &e),
                Err(e) => return Err(e),
            }
        }

        if stopped {
            self.emit(
                &mut results.report,
                LogEntry::new(
                    LogLevel::Warning,
                    TAG,
                    message_ids::RESTORE_STOPPED_EARLY,
                    "restore stopped after {0} of {1} files",
                )
                .with_args([results.restored_files + results.skipped_files, files.len() as u64]),
            );
            results.report.state = OperationState::Stopped;
        }
        Ok(results)
    }

    /// Write one file through a temp file next to `dest`. Returns the
    /// number of bytes written.
    fn restore_file(&self, file: &FileRecord, dest: &Path, cache: &mut VolumeCache) -> Result<u64> {
        let parent = dest
            .parent()
            .ok_or_else(|| EngineError::InvalidRequest(format!("no parent for {}", dest.display())))?;
        fs::create_dir_all(parent)?;
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{name}.strata-restore.tmp"));

        let written = match self.write_blocks(file, &temp, cache) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp, dest) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        if let Some(mtime) = file.mtime {
            filetime::set_file_mtime(dest, FileTime::from_unix_time(mtime, 0))?;
        }
        Ok(written)
    }

    fn write_blocks(&self, file: &FileRecord, temp: &Path, cache: &mut VolumeCache) -> Result<u64> {
        let handle = File::create(temp)?;
        let mut out = BufWriter::new(handle);
        let mut written = 0u64;
        for digest in &file.blocks {
            let block = self.catalog.block(digest)?.ok_or_else(|| {
                EngineError::ConsistencyViolation(format!(
                    "block {} of {} is not in the catalog",
                    digest.short(),
                    file.path
                ))
            })?;
            let reader = cache.get(&self.remote, &block.volume)?;
            let data = reader.get_verified(digest)?;
            out.write_all(data)?;
            written += data.len() as u64;
        }
        if written != file.size {
            return Err(EngineError::ConsistencyViolation(format!(
                "{} restored {} bytes, expected {}",
                file.path, written, file.size
            )));
        }
        let handle = out.into_inner().map_err(|e| e.into_error())?;
        handle.sync_all()?;
        Ok(written)
    }

    fn restore_failed(&self, results: &mut RestoreResults, path: &str, error: &EngineError) {
        self.emit(
            &mut results.report,
            LogEntry::new(LogLevel::Error, TAG, message_ids::RESTORE_FAILED, "failed to restore {0}: {1}")
                .with_args([path.to_string(), error.to_string()]),
        );
    }
}

/// Errors that cost one file rather than the whole restore.
fn is_file_scoped(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::Io(_)
            | EngineError::Pack(_)
            | EngineError::Cas(_)
            | EngineError::MalformedRemote { .. }
            | EngineError::InvalidRequest(_)
            | EngineError::Backend(BackendError::NotFound(_))
    )
}

/// Where a stored path lands.
fn destination(stored: &str, target: Option<&Path>, base: &Path) -> Result<PathBuf> {
    let path = Path::new(stored);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(EngineError::InvalidRequest(format!("refusing path with '..': {stored}")));
    }
    let Some(target) = target else {
        return Ok(path.to_path_buf());
    };
    let relative = path.strip_prefix(base).unwrap_or(path);
    let relative: PathBuf = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if relative.as_os_str().is_empty() {
        return Err(EngineError::InvalidRequest(format!("empty restore path for {stored}")));
    }
    Ok(target.join(relative))
}

/// Longest directory shared by every path.
fn common_directory<'a>(paths: impl Iterator<Item = &'a str>) -> PathBuf {
    let mut common: Option<Vec<Component<'a>>> = None;
    for path in paths {
        let dir: Vec<Component<'a>> = Path::new(path)
            .parent()
            .map(|p| p.components().collect())
            .unwrap_or_default();
        common = Some(match common {
            None => dir,
            Some(prev) => prev
                .into_iter()
                .zip(dir)
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }
    common.unwrap_or_default().into_iter().collect()
}

/// Most recently used volumes, newest at the back.
struct VolumeCache {
    capacity: usize,
    entries: VecDeque<(String, Arc<VolumeReader>)>,
}

impl VolumeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    fn get(&mut self, remote: &RemoteStore, volume: &str) -> Result<Arc<VolumeReader>> {
        if let Some(pos) = self.entries.iter().position(|(name, _)| name == volume) {
            if let Some(entry) = self.entries.remove(pos) {
                let reader = entry.1.clone();
                self.entries.push_back(entry);
                return Ok(reader);
            }
        }
        let reader = Arc::new(remote.get_volume(volume)?);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((volume.to_string(), reader.clone()));
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_directory() {
        let paths = ["/data/src/a.txt", "/data/src/sub/b.txt", "/data/src/c.txt"];
        assert_eq!(common_directory(paths.into_iter()), PathBuf::from("/data/src"));
        assert_eq!(
            common_directory(["/data/src/a.txt"].into_iter()),
            PathBuf::from("/data/src")
        );
        assert_eq!(
            common_directory(["/x/a", "/y/b"].into_iter()),
            PathBuf::from("/")
        );
    }

    #[test]
    fn test_destination_mapping() {
        let base = PathBuf::from("/data/src");
        let target = Path::new("/restore");
        assert_eq!(
            destination("/data/src/sub/b.txt", Some(target), &base).unwrap(),
            PathBuf::from("/restore/sub/b.txt")
        );
        assert_eq!(
            destination("/data/src/a.txt", None, &base).unwrap(),
            PathBuf::from("/data/src/a.txt")
        );
        assert!(destination("/data/src/../etc/passwd", Some(target), &base).is_err());
    }
}
