//! # strata-catalog
//!
//! Persistent, crash-safe catalog for Strata.
//!
//! The catalog is the single source of truth for which versions exist,
//! which files each version holds, which volume every block lives in, and
//! how many file entries reference each block. It is an LMDB environment
//! with five named databases:
//!
//! | database   | key                      | value            |
//! |------------|--------------------------|------------------|
//! | `filesets` | version (u64, BE)        | [`FilesetRecord`] |
//! | `files`    | version (u64, BE) ++ path | [`FileRecord`]    |
//! | `blocks`   | digest                   | [`BlockRecord`]   |
//! | `volumes`  | volume name              | [`VolumeRecord`]  |
//! | `meta`     | name                     | u64 counter      |
//!
//! Every multi-record change (recording a file, committing, deleting a
//! version, purging, sweeping) runs inside one write transaction. LMDB
//! admits a single writer at a time, so reference count updates for a
//! digest are serialized, and readers never see half of a change.

mod fileset;
mod records;
mod recovery;
mod refs;

pub use fileset::{DeleteOutcome, NewFile, PurgeOutcome};
pub use records::{
    BlockRecord, FileRecord, FilesetRecord, FilesetStatus, VolumeRecord, VolumeState,
};
pub use refs::SweptVolume;

use std::path::Path;

use heed::types::{Bytes, SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;
use tracing::debug;

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An invariant of the reference graph would be broken. Always fatal;
    /// the enclosing transaction is aborted.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Catalog corrupted: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

const META_NEXT_VERSION: &str = "next_version";

/// Aggregate numbers over the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub filesets: u64,
    pub blocks: u64,
    pub referenced_blocks: u64,
    pub live_bytes: u64,
    pub volumes: u64,
}

/// LMDB-backed catalog.
pub struct Catalog {
    env: Env,
    filesets: Database<Bytes, SerdeBincode<FilesetRecord>>,
    files: Database<Bytes, SerdeBincode<FileRecord>>,
    blocks: Database<Bytes, SerdeBincode<BlockRecord>>,
    volumes: Database<Str, SerdeBincode<VolumeRecord>>,
    meta: Database<Str, SerdeBincode<u64>>,
}

impl Catalog {
    /// Default LMDB map size: 1GB (expandable)
    const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

    const MAX_READERS: u32 = 126;

    /// Open or create a catalog in the directory `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_readers(Self::MAX_READERS)
                .max_dbs(5)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let filesets = env.create_database(&mut wtxn, Some("filesets"))?;
        let files = env.create_database(&mut wtxn, Some("files"))?;
        let blocks = env.create_database(&mut wtxn, Some("blocks"))?;
        let volumes = env.create_database(&mut wtxn, Some("volumes"))?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        debug!("Opened catalog at {:?}", path);

        Ok(Self {
            env,
            filesets,
            files,
            blocks,
            volumes,
            meta,
        })
    }

    /// True when no fileset (of any status) is recorded.
    pub fn is_empty(&self) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.filesets.len(&rtxn)? == 0)
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = CatalogStats {
            filesets: self.filesets.len(&rtxn)?,
            volumes: self.volumes.len(&rtxn)?,
            ..Default::default()
        };
        for entry in self.blocks.iter(&rtxn)? {
            let (_, block) = entry?;
            stats.blocks += 1;
            if block.refs > 0 {
                stats.referenced_blocks += 1;
                stats.live_bytes += block.size;
            }
        }
        Ok(stats)
    }

    /// Flush LMDB to disk.
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

pub(crate) fn version_key(version: u64) -> [u8; 8] {
    version.to_be_bytes()
}

pub(crate) fn file_key(version: u64, path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + path.len());
    key.extend_from_slice(&version.to_be_bytes());
    key.extend_from_slice(path.as_bytes());
    key
}

pub(crate) fn decode_version(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(..8)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| CatalogError::Corrupted(format!("short key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
