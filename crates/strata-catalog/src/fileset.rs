//! Version lifecycle: begin, record files, commit, list, delete, purge.

use std::collections::HashSet;

use chrono::Utc;
use heed::RwTxn;
use tracing::{debug, info, instrument};

use strata_cas::BlockDigest;

use crate::{
    decode_version, file_key, version_key, Catalog, CatalogError, FileRecord, FilesetRecord,
    FilesetStatus, Result, META_NEXT_VERSION,
};

/// A file to record into an in-progress fileset.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub path: String,
    pub size: u64,
    pub mtime: Option<i64>,
    /// `(digest, block size, volume)` per block in file order. The volume is
    /// only consulted for blocks the catalog does not know yet.
    pub blocks: Vec<(BlockDigest, u64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub version: u64,
    pub removed_files: u64,
    /// Bytes of blocks whose last reference went away.
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub version: u64,
    pub removed_paths: Vec<String>,
    /// Bytes of blocks whose last reference went away.
    pub removed_size: u64,
    /// Unchanged by the purge.
    pub status: FilesetStatus,
}

impl Catalog {
    /// Allocate the next version number and open an in-progress fileset.
    ///
    /// Numbers come from a persistent counter and are never handed out
    /// twice, even after the fileset that used one is deleted.
    #[instrument(skip(self), level = "debug")]
    pub fn begin_version(&self) -> Result<FilesetRecord> {
        let mut wtxn = self.env.write_txn()?;
        let counter = self.meta.get(&wtxn, META_NEXT_VERSION)?.unwrap_or(0);
        let after_last = match self.filesets.last(&wtxn)? {
            Some((key, _)) => decode_version(key)? + 1,
            None => 0,
        };
        let version = counter.max(after_last);

        let record = FilesetRecord {
            version,
            created: Utc::now(),
            status: FilesetStatus::InProgress,
            file_count: 0,
            total_size: 0,
            failed_files: 0,
        };
        self.filesets.put(&mut wtxn, &version_key(version), &record)?;
        self.meta.put(&mut wtxn, META_NEXT_VERSION, &(version + 1))?;
        wtxn.commit()?;

        debug!(version, "began fileset");
        Ok(record)
    }

    /// Record one file into an in-progress fileset.
    ///
    /// Unknown blocks are inserted (and their volume registered as pending),
    /// every block position gains one reference, and the file row is
    /// written, all in one transaction.
    #[instrument(skip(self, file), fields(path = %file.path), level = "debug")]
    pub fn record_file(&self, version: u64, file: NewFile) -> Result<FileRecord> {
        let mut wtxn = self.env.write_txn()?;
        let mut fileset = self.load_fileset(&wtxn, version)?;
        if fileset.status != FilesetStatus::InProgress {
            return Err(CatalogError::ConsistencyViolation(format!(
                "fileset {} is already {}",
                version, fileset.status
            )));
        }

        let key = file_key(version, &file.path);
        if self.files.get(&wtxn, &key)?.is_some() {
            return Err(CatalogError::ConsistencyViolation(format!(
                "{} recorded twice in fileset {}",
                file.path, version
            )));
        }

        for (digest, size, volume) in &file.blocks {
            self.insert_or_retain_block(&mut wtxn, digest, *size, volume)?;
        }

        let record = FileRecord {
            path: file.path,
            size: file.size,
            mtime: file.mtime,
            blocks: file.blocks.into_iter().map(|(d, _, _)| d).collect(),
        };
        self.files.put(&mut wtxn, &key, &record)?;

        fileset.file_count += 1;
        fileset.total_size += record.size;
        self.filesets.put(&mut wtxn, &version_key(version), &fileset)?;
        wtxn.commit()?;
        Ok(record)
    }

    /// Finalize an in-progress fileset.
    ///
    /// The status becomes `Full` only when `completed` is set and no file
    /// failed. Every block the fileset references must live in a durable
    /// volume, otherwise nothing is committed.
    #[instrument(skip(self), level = "debug")]
    pub fn commit(&self, version: u64, completed: bool, failed_files: u64) -> Result<FilesetRecord> {
        let mut wtxn = self.env.write_txn()?;
        let mut fileset = self.load_fileset(&wtxn, version)?;
        if fileset.status != FilesetStatus::InProgress {
            return Err(CatalogError::ConsistencyViolation(format!(
                "fileset {} is already {}",
                version, fileset.status
            )));
        }

        {
            let mut durable: HashSet<String> = HashSet::new();
            for entry in self.files.prefix_iter(&wtxn, &version_key(version))? {
                let (_, file) = entry?;
                for digest in &file.blocks {
                    let block = self.blocks.get(&wtxn, digest.as_bytes())?.ok_or_else(|| {
                        CatalogError::ConsistencyViolation(format!(
                            "{} references missing block {}",
                            file.path,
                            digest.short()
                        ))
                    })?;
                    if durable.contains(&block.volume) {
                        continue;
                    }
                    let state = self.volumes.get(&wtxn, &block.volume)?.map(|v| v.state);
                    match state {
                        Some(s) if s.is_durable() => {
                            durable.insert(block.volume);
                        }
                        other => {
                            return Err(CatalogError::ConsistencyViolation(format!(
                                "{} references volume {} in state {:?}",
                                file.path, block.volume, other
                            )));
                        }
                    }
                }
            }
        }

        fileset.status = if completed && failed_files == 0 {
            FilesetStatus::Full
        } else {
            FilesetStatus::Partial
        };
        fileset.failed_files = failed_files;
        self.filesets.put(&mut wtxn, &version_key(version), &fileset)?;
        wtxn.commit()?;

        info!(version, status = %fileset.status, files = fileset.file_count, "committed fileset");
        Ok(fileset)
    }

    /// Committed filesets, ascending by version.
    pub fn list_versions(&self) -> Result<Vec<FilesetRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.filesets.iter(&rtxn)? {
            let (_, record) = entry?;
            if record.status.is_committed() {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Any fileset, including one still in progress.
    pub fn get_version(&self, version: u64) -> Result<Option<FilesetRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.filesets.get(&rtxn, &version_key(version))?)
    }

    pub fn latest_committed(&self) -> Result<Option<FilesetRecord>> {
        Ok(self.list_versions()?.pop())
    }

    /// Files of `version` whose path satisfies `filter`, sorted by path.
    pub fn list_files<F>(&self, version: u64, filter: F) -> Result<Vec<FileRecord>>
    where
        F: Fn(&str) -> bool,
    {
        let rtxn = self.env.read_txn()?;
        if self.filesets.get(&rtxn, &version_key(version))?.is_none() {
            return Err(CatalogError::NotFound(format!("fileset {}", version)));
        }
        let mut out = Vec::new();
        for entry in self.files.prefix_iter(&rtxn, &version_key(version))? {
            let (_, file) = entry?;
            if filter(&file.path) {
                out.push(file);
            }
        }
        Ok(out)
    }

    pub fn get_file(&self, version: u64, path: &str) -> Result<Option<FileRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.files.get(&rtxn, &file_key(version, path))?)
    }

    /// Remove a fileset and release every reference its files hold.
    ///
    /// Other filesets are untouched; blocks shared with them keep their
    /// remaining references.
    #[instrument(skip(self), level = "debug")]
    pub fn delete_version(&self, version: u64) -> Result<DeleteOutcome> {
        let mut wtxn = self.env.write_txn()?;
        self.load_fileset(&wtxn, version)?;

        let files = self.collect_files(&wtxn, version, |_| true)?;
        let mut freed_bytes = 0;
        for (key, file) in &files {
            freed_bytes += self.release_blocks(&mut wtxn, &file.blocks)?;
            self.files.delete(&mut wtxn, key)?;
        }
        self.filesets.delete(&mut wtxn, &version_key(version))?;
        wtxn.commit()?;

        info!(version, files = files.len(), freed_bytes, "deleted fileset");
        Ok(DeleteOutcome {
            version,
            removed_files: files.len() as u64,
            freed_bytes,
        })
    }

    /// Remove matching files from a committed fileset.
    ///
    /// The fileset keeps its status: purging a `Partial` fileset never makes
    /// it `Full`.
    #[instrument(skip(self, predicate), level = "debug")]
    pub fn purge_files<F>(&self, version: u64, predicate: F) -> Result<PurgeOutcome>
    where
        F: Fn(&str) -> bool,
    {
        let mut wtxn = self.env.write_txn()?;
        let mut fileset = self.load_fileset(&wtxn, version)?;
        if !fileset.status.is_committed() {
            return Err(CatalogError::ConsistencyViolation(format!(
                "cannot purge in-progress fileset {}",
                version
            )));
        }

        let files = self.collect_files(&wtxn, version, predicate)?;
        let mut removed_size = 0;
        let mut removed_paths = Vec::with_capacity(files.len());
        for (key, file) in files {
            removed_size += self.release_blocks(&mut wtxn, &file.blocks)?;
            self.files.delete(&mut wtxn, &key)?;
            fileset.file_count = fileset.file_count.saturating_sub(1);
            fileset.total_size = fileset.total_size.saturating_sub(file.size);
            removed_paths.push(file.path);
        }
        self.filesets.put(&mut wtxn, &version_key(version), &fileset)?;
        wtxn.commit()?;

        if !removed_paths.is_empty() {
            info!(version, files = removed_paths.len(), removed_size, "purged files");
        }
        Ok(PurgeOutcome {
            version,
            removed_paths,
            removed_size,
            status: fileset.status,
        })
    }

    pub(crate) fn load_fileset(&self, txn: &heed::RoTxn, version: u64) -> Result<FilesetRecord> {
        self.filesets
            .get(txn, &version_key(version))?
            .ok_or_else(|| CatalogError::NotFound(format!("fileset {}", version)))
    }

    fn collect_files<F>(
        &self,
        txn: &RwTxn,
        version: u64,
        predicate: F,
    ) -> Result<Vec<(Vec<u8>, FileRecord)>>
    where
        F: Fn(&str) -> bool,
    {
        let mut out = Vec::new();
        for entry in self.files.prefix_iter(txn, &version_key(version))? {
            let (key, file) = entry?;
            if predicate(&file.path) {
                out.push((key.to_vec(), file));
            }
        }
        Ok(out)
    }
}
