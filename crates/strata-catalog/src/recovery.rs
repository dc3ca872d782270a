//! Crash recovery and catalog rebuild from remote files.

use tracing::{info, instrument};

use strata_cas::BlockDigest;

use crate::{
    file_key, version_key, BlockRecord, Catalog, CatalogError, FileRecord, FilesetRecord,
    FilesetStatus, Result, VolumeRecord, VolumeState, META_NEXT_VERSION,
};

impl Catalog {
    /// Filesets left in progress by a run that never committed.
    pub fn interrupted_versions(&self) -> Result<Vec<u64>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.filesets.iter(&rtxn)? {
            let (_, record) = entry?;
            if record.status == FilesetStatus::InProgress {
                out.push(record.version);
            }
        }
        Ok(out)
    }

    /// Volumes whose upload was never confirmed.
    pub fn pending_volumes(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self
            .volumes()?
            .into_iter()
            .filter(|v| v.state == VolumeState::Pending)
            .collect())
    }

    /// Register a volume found on the backend, with its self-described index.
    ///
    /// Blocks not yet known are inserted unreferenced; an already known
    /// volume is left alone. Returns the number of new block rows.
    #[instrument(skip(self, blocks), level = "debug")]
    pub fn import_volume(&self, name: &str, size: u64, blocks: &[(BlockDigest, u64)]) -> Result<u64> {
        let mut wtxn = self.env.write_txn()?;
        if self.volumes.get(&wtxn, name)?.is_some() {
            return Ok(0);
        }

        let mut inserted = 0;
        for (digest, block_size) in blocks {
            if self.blocks.get(&wtxn, digest.as_bytes())?.is_none() {
                self.blocks.put(
                    &mut wtxn,
                    digest.as_bytes(),
                    &BlockRecord {
                        size: *block_size,
                        volume: name.to_string(),
                        refs: 0,
                    },
                )?;
                inserted += 1;
            }
        }
        self.volumes.put(
            &mut wtxn,
            name,
            &VolumeRecord {
                name: name.to_string(),
                state: VolumeState::Uploaded,
                size,
                block_count: inserted,
            },
        )?;
        wtxn.commit()?;
        Ok(inserted)
    }

    /// Recreate a committed fileset from a remote file list.
    ///
    /// Every block must already be imported. The version counter is moved
    /// past the imported version so numbers stay unique.
    #[instrument(skip(self, record, files), fields(version = record.version), level = "debug")]
    pub fn import_fileset(&self, record: FilesetRecord, files: Vec<FileRecord>) -> Result<()> {
        if !record.status.is_committed() {
            return Err(CatalogError::ConsistencyViolation(format!(
                "cannot import in-progress fileset {}",
                record.version
            )));
        }

        let mut wtxn = self.env.write_txn()?;
        if self.filesets.get(&wtxn, &version_key(record.version))?.is_some() {
            return Err(CatalogError::ConsistencyViolation(format!(
                "fileset {} already exists",
                record.version
            )));
        }

        let mut fileset = FilesetRecord {
            file_count: 0,
            total_size: 0,
            ..record
        };
        for file in files {
            self.retain_blocks(&mut wtxn, &file.blocks)?;
            fileset.file_count += 1;
            fileset.total_size += file.size;
            self.files
                .put(&mut wtxn, &file_key(fileset.version, &file.path), &file)?;
        }
        self.filesets
            .put(&mut wtxn, &version_key(fileset.version), &fileset)?;

        let next = self.meta.get(&wtxn, META_NEXT_VERSION)?.unwrap_or(0);
        if next <= fileset.version {
            self.meta
                .put(&mut wtxn, META_NEXT_VERSION, &(fileset.version + 1))?;
        }
        wtxn.commit()?;

        info!(
            version = fileset.version,
            status = %fileset.status,
            files = fileset.file_count,
            "imported fileset"
        );
        Ok(())
    }
}
