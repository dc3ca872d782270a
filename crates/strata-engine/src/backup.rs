//! Backup: walk sources, split, dedup, pack, upload, commit.
//!
//! One source file is one unit of work. A unit is recorded in the catalog
//! in a single transaction once all of its blocks are placed, and the stop
//! signal is only consulted between units. Volumes are sealed and handed to
//! the uploader as they fill; the fileset is committed only after every
//! upload of the run is confirmed.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{instrument, warn};
use walkdir::WalkDir;

use strata_cas::{BlockDigest, BlockSplitter};
use strata_catalog::{FileRecord, FilesetStatus, NewFile};
use strata_config::{log_engine_debug, log_engine_info};
use strata_pack::{SealedVolume, VolumePacker};

use crate::controller::{message_ids, Controller};
use crate::filter::PathFilter;
use crate::log_router::{LogEntry, LogLevel};
use crate::results::{BackupResults, Report};
use crate::upload::{UploadOutcome, Uploader};
use crate::{EngineError, OperationState, Result};

const TAG: &str = "Backup";

/// A regular file found under one of the sources.
#[derive(Debug, Clone)]
struct SourceFile {
    path: PathBuf,
    /// Catalog key: the absolute path with `/` separators.
    key: String,
    size: u64,
    mtime: Option<i64>,
}

/// Placement of each block of a file: digest, size, volume.
type Placed = Vec<(BlockDigest, u64, String)>;

impl Controller {
    /// Back up every regular file under `sources` into a new version.
    ///
    /// The version is `Full` when every file was stored, `Partial` when the
    /// run was stopped through [`TaskControl::stop`](crate::TaskControl::stop)
    /// or some files could not be read. A hard abort returns
    /// [`EngineError::Aborted`] and leaves nothing committed.
    #[instrument(skip(self, sources), fields(sources = sources.len()))]
    pub fn backup<P: AsRef<Path>>(&self, sources: &[P]) -> Result<BackupResults> {
        self.operate("Backup", || self.run_backup(sources))
    }

    fn run_backup<P: AsRef<Path>>(&self, sources: &[P]) -> Result<BackupResults> {
        if sources.is_empty() {
            return Err(EngineError::InvalidRequest("no backup sources given".into()));
        }
        let mut report = Report::default();
        self.recover(&mut report)?;

        let filter = PathFilter::all().excluding(self.options.exclude.iter().cloned());
        let (files, walk_errors) = collect_sources(sources, &filter)?;
        let previous: HashMap<String, FileRecord> = match self.catalog.latest_committed()? {
            Some(last) => self
                .catalog
                .list_files(last.version, |_| true)?
                .into_iter()
                .map(|f| (f.path.clone(), f))
                .collect(),
            None => HashMap::new(),
        };

        let fileset = self.catalog.begin_version()?;
        log_engine_info!(
            "backup started",
            version = fileset.version,
            files = files.len(),
            previous = previous.len()
        );

        let mut run = BackupRun {
            ctl: self,
            version: fileset.version,
            splitter: BlockSplitter::new(self.options.block_size)?,
            packer: VolumePacker::new(self.options.prefix.clone(), self.options.volume_size),
            uploader: Some(Uploader::start(
                self.remote.clone(),
                self.options.upload_workers,
                self.options.upload_queue,
            )),
            previous,
            results: BackupResults::new(fileset.version),
        };
        run.results.report = report;

        let stopped = walk_errors
            .iter()
            .try_for_each(|(path, reason)| run.file_failed(path, reason))
            .and_then(|()| run.process(files));

        match stopped {
            Ok(stopped) => run.complete(stopped),
            Err(EngineError::Aborted) => {
                run.abandon();
                Err(EngineError::Aborted)
            }
            Err(e) => {
                run.rollback();
                Err(e)
            }
        }
    }
}

struct BackupRun<'a> {
    ctl: &'a Controller,
    version: u64,
    splitter: BlockSplitter,
    packer: VolumePacker,
    uploader: Option<Uploader>,
    /// Files of the last committed version, consumed as they are matched.
    previous: HashMap<String, FileRecord>,
    results: BackupResults,
}

impl BackupRun<'_> {
    /// Process files until done or told to stop. Returns whether work was
    /// left undone because of a stop request.
    fn process(&mut self, files: Vec<SourceFile>) -> Result<bool> {
        let control = self.ctl.control().clone();
        for file in files {
            if control.is_abort_requested() {
                return Err(EngineError::Aborted);
            }
            if control.should_stop() {
                log_engine_info!("stop requested", version = self.version);
                return Ok(true);
            }
            self.process_file(&file)?;
            let outcomes = self.uploader_mut()?.poll();
            self.apply(outcomes)?;
            self.ctl.notify_unit(&file.path);
        }
        if control.is_abort_requested() {
            return Err(EngineError::Aborted);
        }
        Ok(false)
    }

    fn process_file(&mut self, file: &SourceFile) -> Result<()> {
        self.results.examined_files += 1;
        self.results.size_of_examined += file.size;

        let previous = self.previous.remove(&file.key);
        let reused = match &previous {
            Some(prev)
                if !self.ctl.options.always_rehash
                    && file.mtime.is_some()
                    && prev.mtime == file.mtime
                    && prev.size == file.size =>
            {
                self.known_blocks(prev)?
            }
            _ => None,
        };

        let (blocks, size) = match reused {
            Some(blocks) => (blocks, file.size),
            None => match self.ingest(file) {
                Ok(ingested) => ingested,
                Err(e) if !e.is_fatal() => return self.file_failed(&file.key, &e.to_string()),
                Err(e) => return Err(e),
            },
        };

        let unchanged = previous
            .as_ref()
            .map(|p| p.blocks.len() == blocks.len() && p.blocks.iter().zip(&blocks).all(|(a, b)| *a == b.0))
            .unwrap_or(false);
        match (&previous, unchanged) {
            (None, _) => self.results.added_files += 1,
            (Some(_), true) => self.results.unchanged_files += 1,
            (Some(_), false) => self.results.modified_files += 1,
        }

        self.ctl.catalog.record_file(
            self.version,
            NewFile {
                path: file.key.clone(),
                size,
                mtime: file.mtime,
                blocks,
            },
        )?;
        log_engine_debug!("recorded file", path = file.key.as_str(), size = size);
        Ok(())
    }

    /// Block placement of an unchanged file, if the catalog still has
    /// every block.
    fn known_blocks(&self, prev: &FileRecord) -> Result<Option<Placed>> {
        let mut placed = Vec::with_capacity(prev.blocks.len());
        for digest in &prev.blocks {
            match self.ctl.catalog.block(digest)? {
                Some(block) => placed.push((*digest, block.size, block.volume)),
                None => return Ok(None),
            }
        }
        Ok(Some(placed))
    }

    fn ingest(&mut self, file: &SourceFile) -> Result<(Placed, u64)> {
        let reader = File::open(&file.path)?;
        let mut blocks = self.splitter.split(reader);
        let mut placed = Vec::new();
        let mut size = 0;
        loop {
            let batch = self
                .splitter
                .next_digested_batch(&mut blocks, self.ctl.options.hash_batch)?;
            if batch.is_empty() {
                break;
            }
            for block in batch {
                let len = block.data.len() as u64;
                let volume = self.place(block.digest, &block.data)?;
                placed.push((block.digest, len, volume));
                size += len;
            }
        }
        Ok((placed, size))
    }

    /// Volume holding `digest`, packing it if no volume has it yet.
    fn place(&mut self, digest: BlockDigest, data: &[u8]) -> Result<String> {
        if let Some(known) = self.ctl.catalog.block(&digest)? {
            self.results.deduplicated_blocks += 1;
            return Ok(known.volume);
        }
        if let Some(volume) = self.packer.lookup(&digest) {
            self.results.deduplicated_blocks += 1;
            return Ok(volume.to_string());
        }
        let assignment = self.packer.add(digest, data);
        self.results.new_blocks += 1;
        if let Some(sealed) = self.packer.flush_if_full()? {
            self.submit(sealed)?;
        }
        Ok(assignment.volume().to_string())
    }

    fn submit(&mut self, sealed: SealedVolume) -> Result<()> {
        log_engine_debug!(
            "volume sealed",
            volume = sealed.name.as_str(),
            blocks = sealed.block_count()
        );
        self.uploader_mut()?.submit(sealed)?;
        let outcomes = self.uploader_mut()?.poll();
        self.apply(outcomes)
    }

    fn uploader_mut(&mut self) -> Result<&mut Uploader> {
        self.uploader
            .as_mut()
            .ok_or_else(|| EngineError::InvalidRequest("uploader already shut down".into()))
    }

    /// Record confirmed uploads; the first failure is returned after every
    /// success has been recorded.
    fn apply(&mut self, outcomes: Vec<UploadOutcome>) -> Result<()> {
        let mut failure = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(size) => {
                    self.ctl.catalog.mark_volume_uploaded(&outcome.volume, size)?;
                    self.results.uploaded_volumes += 1;
                    self.results.uploaded_bytes += size;
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn file_failed(&mut self, path: &str, reason: &str) -> Result<()> {
        self.results.failed_files += 1;
        self.ctl.emit(
            &mut self.results.report,
            LogEntry::new(LogLevel::Error, TAG, message_ids::FILE_FAILED, "failed to back up {0}: {1}")
                .with_args([path, reason]),
        );
        let threshold = self.ctl.options.error_threshold;
        if self.results.failed_files > threshold {
            return Err(EngineError::ErrorThresholdExceeded {
                failed: self.results.failed_files,
                threshold,
            });
        }
        Ok(())
    }

    /// Flush, wait for uploads, commit, publish the file list, then apply
    /// retention and sweep.
    fn complete(mut self, stopped: bool) -> Result<BackupResults> {
        let finished = self.finish_uploads();
        if let Err(e) = finished {
            self.rollback();
            return Err(e);
        }

        let failed = self.results.failed_files;
        let record = match self.ctl.catalog.commit(self.version, !stopped, failed) {
            Ok(record) => record,
            Err(e) => {
                self.rollback();
                return Err(e.into());
            }
        };
        self.results.status = record.status;
        let ctl = self.ctl;
        let report = &mut self.results.report;

        if stopped {
            ctl.emit(
                report,
                LogEntry::new(
                    LogLevel::Warning,
                    TAG,
                    message_ids::BACKUP_STOPPED_EARLY,
                    "backup stopped before all files were processed, version {0} is partial",
                )
                .with_args([record.version]),
            );
        }

        let files = ctl.catalog.list_files(record.version, |_| true)?;
        if let Err(e) = ctl.remote.put_file_list(&record, &files) {
            ctl.emit(
                report,
                LogEntry::new(
                    LogLevel::Error,
                    TAG,
                    message_ids::FILE_LIST_UPLOAD_FAILED,
                    "could not upload the file list of version {0}: {1}",
                )
                .with_args([record.version.to_string(), e.to_string()]),
            );
        }

        if record.status == FilesetStatus::Full && ctl.options.has_retention() {
            self.results.deleted_versions = ctl.apply_retention()?;
        }
        ctl.sweep_and_delete(&mut self.results.report)?;

        self.results.report.state = if stopped {
            OperationState::Stopped
        } else {
            OperationState::Completed
        };
        log_engine_info!(
            "backup committed",
            version = record.version,
            status = tracing::field::display(record.status),
            new_blocks = self.results.new_blocks,
            uploaded_volumes = self.results.uploaded_volumes
        );
        Ok(self.results)
    }

    fn finish_uploads(&mut self) -> Result<()> {
        if let Some(sealed) = self.packer.finalize_open_volume()? {
            self.submit(sealed)?;
        }
        let uploader = self
            .uploader
            .take()
            .ok_or_else(|| EngineError::InvalidRequest("uploader already shut down".into()))?;
        let outcomes = uploader.finish();
        self.apply(outcomes)
    }

    /// Hard abort: let in-flight uploads land, leave the fileset in
    /// progress for the next recovery.
    fn abandon(&mut self) {
        if let Some(uploader) = self.uploader.take() {
            for outcome in uploader.abort() {
                if let Ok(size) = outcome.result {
                    if let Err(e) = self.ctl.catalog.mark_volume_uploaded(&outcome.volume, size) {
                        warn!(volume = outcome.volume.as_str(), error = %e, "could not record uploaded volume");
                    }
                }
            }
        }
        warn!(version = self.version, "backup aborted, fileset left in progress");
    }

    /// Undo the fileset after a fatal error, best effort.
    fn rollback(&mut self) {
        self.abandon();
        if let Err(e) = self.ctl.catalog.delete_version(self.version) {
            warn!(version = self.version, error = %e, "rollback failed");
            return;
        }
        let mut scratch = Report::default();
        if let Err(e) = self.ctl.sweep_and_delete(&mut scratch) {
            warn!(version = self.version, error = %e, "sweep after rollback failed");
        }
    }
}

/// Regular files under `sources`, sorted by catalog key, plus the paths
/// that could not be examined.
fn collect_sources<P: AsRef<Path>>(
    sources: &[P],
    filter: &PathFilter,
) -> Result<(Vec<SourceFile>, Vec<(String, String)>)> {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for source in sources {
        let source = source.as_ref();
        let root = fs::canonicalize(source).map_err(|e| {
            EngineError::InvalidRequest(format!("cannot read source {}: {e}", source.display()))
        })?;
        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(path_key).unwrap_or_else(|| path_key(&root));
                    errors.push((path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let key = path_key(entry.path());
            if !filter.matches(&key) || !seen.insert(key.clone()) {
                continue;
            }
            match entry.metadata() {
                Ok(metadata) => files.push(SourceFile {
                    path: entry.path().to_path_buf(),
                    key,
                    size: metadata.len(),
                    mtime: mtime_secs(&metadata),
                }),
                Err(e) => errors.push((key, e.to_string())),
            }
        }
    }
    files.sort_by(|a, b| a.key.cmp(&b.key));
    Ok((files, errors))
}

pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn mtime_secs(metadata: &Metadata) -> Option<i64> {
    let modified = metadata.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}
