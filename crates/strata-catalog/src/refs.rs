//! Reference counting and the sweep of dead volumes.

use std::collections::{HashMap, HashSet};

use heed::RwTxn;
use tracing::{debug, info, instrument, warn};

use strata_cas::BlockDigest;

use crate::{version_key, BlockRecord, Catalog, CatalogError, Result, VolumeRecord, VolumeState};

/// A volume whose blocks are all unreferenced. Its block rows are gone and
/// it is marked [`VolumeState::Deleting`] until [`Catalog::forget_volume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptVolume {
    pub name: String,
    pub size: u64,
    pub block_count: u64,
}

impl Catalog {
    /// Add one reference per digest on behalf of `version`.
    ///
    /// Every digest must already be known.
    pub fn add_references(&self, version: u64, digests: &[BlockDigest]) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.load_fileset(&wtxn, version)?;
        self.retain_blocks(&mut wtxn, digests)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Drop one reference per digest on behalf of `version`.
    ///
    /// Returns the bytes of blocks that reached zero. A decrement below
    /// zero aborts the whole call with [`CatalogError::ConsistencyViolation`].
    pub fn remove_references(&self, version: u64, digests: &[BlockDigest]) -> Result<u64> {
        let mut wtxn = self.env.write_txn()?;
        self.load_fileset(&wtxn, version)?;
        let freed = self.release_blocks(&mut wtxn, digests)?;
        wtxn.commit()?;
        Ok(freed)
    }

    pub fn block(&self, digest: &BlockDigest) -> Result<Option<BlockRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.blocks.get(&rtxn, digest.as_bytes())?)
    }

    /// Current reference count; zero for unknown blocks.
    pub fn ref_count(&self, digest: &BlockDigest) -> Result<u64> {
        Ok(self.block(digest)?.map(|b| b.refs).unwrap_or(0))
    }

    pub fn volume(&self, name: &str) -> Result<Option<VolumeRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.volumes.get(&rtxn, name)?)
    }

    pub fn volumes(&self) -> Result<Vec<VolumeRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.volumes.iter(&rtxn)? {
            let (_, volume) = entry?;
            out.push(volume);
        }
        Ok(out)
    }

    /// Record a confirmed upload.
    ///
    /// A volume with no row yet (all of its blocks belonged to files that
    /// failed before being recorded) is registered with no blocks, so the
    /// next sweep removes it.
    pub fn mark_volume_uploaded(&self, name: &str, size: u64) -> Result<()> {
        {
            let mut wtxn = self.env.write_txn()?;
            if self.volumes.get(&wtxn, name)?.is_none() {
                debug!(volume = name, "registering upload of an unreferenced volume");
                self.volumes.put(
                    &mut wtxn,
                    name,
                    &VolumeRecord {
                        name: name.to_string(),
                        state: VolumeState::Uploaded,
                        size,
                        block_count: 0,
                    },
                )?;
                wtxn.commit()?;
                return Ok(());
            }
        }
        self.set_volume_state(name, VolumeState::Uploaded, Some(size))
    }

    pub fn mark_volume_verified(&self, name: &str) -> Result<()> {
        self.set_volume_state(name, VolumeState::Verified, None)
    }

    /// Find volumes with no live block and mark them for deletion.
    ///
    /// A volume is only returned when every one of its blocks has a zero
    /// count, checked inside the same transaction that removes the block
    /// rows, so no concurrent reference can slip in between. Volumes left
    /// in `Deleting` by an earlier sweep are returned again.
    #[instrument(skip(self), level = "debug")]
    pub fn sweep_unreferenced(&self) -> Result<Vec<SweptVolume>> {
        let mut wtxn = self.env.write_txn()?;

        let mut live: HashSet<String> = HashSet::new();
        let mut dead_blocks: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for entry in self.blocks.iter(&wtxn)? {
            let (key, block) = entry?;
            if block.refs > 0 {
                live.insert(block.volume);
            } else {
                dead_blocks.entry(block.volume).or_default().push(key.to_vec());
            }
        }

        let mut candidates = Vec::new();
        for entry in self.volumes.iter(&wtxn)? {
            let (_, volume) = entry?;
            if !live.contains(&volume.name) {
                candidates.push(volume);
            }
        }

        let mut swept = Vec::with_capacity(candidates.len());
        for mut volume in candidates {
            let keys = dead_blocks.remove(&volume.name).unwrap_or_default();
            for key in &keys {
                self.blocks.delete(&mut wtxn, key)?;
            }
            if volume.state != VolumeState::Deleting {
                volume.state = VolumeState::Deleting;
                self.volumes.put(&mut wtxn, &volume.name, &volume)?;
            }
            swept.push(SweptVolume {
                name: volume.name,
                size: volume.size,
                block_count: volume.block_count,
            });
        }
        wtxn.commit()?;

        if !swept.is_empty() {
            info!(volumes = swept.len(), "swept unreferenced volumes");
        }
        Ok(swept)
    }

    /// Drop the row of a volume that was deleted remotely.
    pub fn forget_volume(&self, name: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        match self.volumes.get(&wtxn, name)? {
            Some(v) if v.state != VolumeState::Deleting => {
                return Err(CatalogError::ConsistencyViolation(format!(
                    "volume {} is {} and cannot be forgotten",
                    name, v.state
                )));
            }
            Some(_) => {
                self.volumes.delete(&mut wtxn, name)?;
            }
            None => debug!(volume = name, "forgetting unknown volume"),
        }
        wtxn.commit()?;
        Ok(())
    }

    pub(crate) fn insert_or_retain_block(
        &self,
        wtxn: &mut RwTxn,
        digest: &BlockDigest,
        size: u64,
        volume: &str,
    ) -> Result<()> {
        if let Some(mut block) = self.blocks.get(wtxn, digest.as_bytes())? {
            if block.size != size {
                return Err(CatalogError::ConsistencyViolation(format!(
                    "block {} recorded with size {} but stored with {}",
                    digest.short(),
                    size,
                    block.size
                )));
            }
            block.refs += 1;
            self.blocks.put(wtxn, digest.as_bytes(), &block)?;
            return Ok(());
        }

        let mut record = self.volumes.get(wtxn, volume)?.unwrap_or(VolumeRecord {
            name: volume.to_string(),
            state: VolumeState::Pending,
            size: 0,
            block_count: 0,
        });
        if record.state == VolumeState::Deleting {
            return Err(CatalogError::ConsistencyViolation(format!(
                "new block {} assigned to deleted volume {}",
                digest.short(),
                volume
            )));
        }
        record.block_count += 1;
        self.volumes.put(wtxn, volume, &record)?;
        self.blocks.put(
            wtxn,
            digest.as_bytes(),
            &BlockRecord {
                size,
                volume: volume.to_string(),
                refs: 1,
            },
        )?;
        Ok(())
    }

    pub(crate) fn retain_blocks(&self, wtxn: &mut RwTxn, digests: &[BlockDigest]) -> Result<()> {
        for digest in digests {
            let mut block = self.blocks.get(wtxn, digest.as_bytes())?.ok_or_else(|| {
                CatalogError::ConsistencyViolation(format!("unknown block {}", digest.short()))
            })?;
            block.refs += 1;
            self.blocks.put(wtxn, digest.as_bytes(), &block)?;
        }
        Ok(())
    }

    pub(crate) fn release_blocks(&self, wtxn: &mut RwTxn, digests: &[BlockDigest]) -> Result<u64> {
        let mut freed = 0;
        for digest in digests {
            let mut block = self.blocks.get(wtxn, digest.as_bytes())?.ok_or_else(|| {
                CatalogError::ConsistencyViolation(format!("unknown block {}", digest.short()))
            })?;
            if block.refs == 0 {
                warn!(block = %digest.short(), "reference count would go negative");
                return Err(CatalogError::ConsistencyViolation(format!(
                    "reference count of block {} would go negative",
                    digest.short()
                )));
            }
            block.refs -= 1;
            if block.refs == 0 {
                freed += block.size;
            }
            self.blocks.put(wtxn, digest.as_bytes(), &block)?;
        }
        Ok(freed)
    }

    fn set_volume_state(&self, name: &str, state: VolumeState, size: Option<u64>) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let mut volume = self
            .volumes
            .get(&wtxn, name)?
            .ok_or_else(|| CatalogError::NotFound(format!("volume {}", name)))?;
        if volume.state == VolumeState::Deleting {
            return Err(CatalogError::ConsistencyViolation(format!(
                "volume {} is being deleted",
                name
            )));
        }
        volume.state = state;
        if let Some(size) = size {
            volume.size = size;
        }
        self.volumes.put(&mut wtxn, name, &volume)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Versions whose files reference any block in `volume`.
    pub fn versions_using_volume(&self, volume: &str) -> Result<Vec<u64>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.filesets.iter(&rtxn)? {
            let (_, fileset) = entry?;
            let mut uses = false;
            for file in self.files.prefix_iter(&rtxn, &version_key(fileset.version))? {
                let (_, file) = file?;
                for digest in &file.blocks {
                    if let Some(block) = self.blocks.get(&rtxn, digest.as_bytes())? {
                        if block.volume == volume {
                            uses = true;
                            break;
                        }
                    }
                }
                if uses {
                    break;
                }
            }
            if uses {
                out.push(fileset.version);
            }
        }
        Ok(out)
    }
}
