//! # strata-pack
//!
//! Volume format for Strata.
//!
//! Blocks are not uploaded one by one. They are packed into volumes of a
//! target size, and each volume carries its own index so it can be read
//! (or re-indexed during a catalog rebuild) without any other metadata.
//!
//! ## Volume Format
//!
//! ```text
//! +----------------+
//! | Header (32B)   |  Magic, version, entry count, offsets
//! +----------------+
//! | Index Table    |  [Digest, Offset, Length] × N
//! +----------------+
//! | Block Data     |  Raw concatenated blocks, insertion order
//! +----------------+
//! ```

mod packer;

pub use packer::{is_volume_name, volume_file_name, SealedVolume, VolumeAssignment, VolumePacker};

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_cas::BlockDigest;

/// Magic bytes for volume identification
pub const VOLUME_MAGIC: &[u8; 8] = b"STRATAVL";
/// Current volume format version
const VOLUME_VERSION: u32 = 1;
const HEADER_LEN: usize = 32;

/// Errors that can occur during volume operations
#[derive(Error, Debug)]
pub enum PackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Invalid volume: {0}")]
    Invalid(String),

    #[error("Block not found in volume: {digest}")]
    NotFound { digest: String },

    #[error(transparent)]
    Cas(#[from] strata_cas::CasError),
}

pub type Result<T> = std::result::Result<T, PackError>;

/// Volume header (fixed 32 bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeHeader {
    magic: [u8; 8],
    version: u32,
    entry_count: u32,
    index_offset: u64,
    data_offset: u64,
}

impl VolumeHeader {
    fn new(entry_count: u32, index_offset: u64, data_offset: u64) -> Self {
        Self {
            magic: *VOLUME_MAGIC,
            version: VOLUME_VERSION,
            entry_count,
            index_offset,
            data_offset,
        }
    }

    fn validate(&self, total_len: usize) -> Result<()> {
        if &self.magic != VOLUME_MAGIC {
            return Err(PackError::Invalid("Bad magic bytes".to_string()));
        }
        if self.version != VOLUME_VERSION {
            return Err(PackError::Invalid(format!(
                "Unsupported version: {}",
                self.version
            )));
        }
        if self.index_offset != HEADER_LEN as u64
            || self.data_offset < self.index_offset
            || self.data_offset > total_len as u64
        {
            return Err(PackError::Invalid("Offsets out of range".to_string()));
        }
        Ok(())
    }
}

/// Index entry for a block in the volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeIndexEntry {
    pub digest: BlockDigest,
    /// Offset within the data section
    pub offset: u64,
    pub length: u64,
}

/// Reader over a complete volume held in memory.
pub struct VolumeReader {
    bytes: Vec<u8>,
    entries: Vec<VolumeIndexEntry>,
    index: HashMap<BlockDigest, usize>,
    data_offset: usize,
}

impl VolumeReader {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(PackError::Invalid("Volume too small".to_string()));
        }

        let header: VolumeHeader = bincode::deserialize(&bytes[..HEADER_LEN])?;
        header.validate(bytes.len())?;

        let index_bytes = &bytes[header.index_offset as usize..header.data_offset as usize];
        let entries: Vec<VolumeIndexEntry> = bincode::deserialize(index_bytes)?;
        if entries.len() != header.entry_count as usize {
            return Err(PackError::Invalid(format!(
                "Index holds {} entries, header says {}",
                entries.len(),
                header.entry_count
            )));
        }

        let data_len = (bytes.len() as u64) - header.data_offset;
        for entry in &entries {
            if entry.offset.saturating_add(entry.length) > data_len {
                return Err(PackError::Invalid(format!(
                    "Block {} extends past end of volume",
                    entry.digest.short()
                )));
            }
        }

        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.digest, i))
            .collect();

        Ok(Self {
            bytes,
            entries,
            index,
            data_offset: header.data_offset as usize,
        })
    }

    /// Raw block bytes, unverified.
    pub fn get(&self, digest: &BlockDigest) -> Result<&[u8]> {
        let entry = self
            .index
            .get(digest)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| PackError::NotFound {
                digest: digest.to_hex(),
            })?;
        let start = self.data_offset + entry.offset as usize;
        Ok(&self.bytes[start..start + entry.length as usize])
    }

    /// Block bytes after checking them against their digest.
    pub fn get_verified(&self, digest: &BlockDigest) -> Result<&[u8]> {
        let data = self.get(digest)?;
        digest.verify(data)?;
        Ok(data)
    }

    pub fn contains(&self, digest: &BlockDigest) -> bool {
        self.index.contains_key(digest)
    }

    /// Index entries in packing order.
    pub fn entries(&self) -> &[VolumeIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Builds a volume in memory.
#[derive(Debug, Default)]
pub struct VolumeWriter {
    entries: Vec<VolumeIndexEntry>,
    data: Vec<u8>,
}

impl VolumeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block.
    pub fn add(&mut self, digest: BlockDigest, data: &[u8]) {
        let offset = self.data.len() as u64;
        self.entries.push(VolumeIndexEntry {
            digest,
            offset,
            length: data.len() as u64,
        });
        self.data.extend_from_slice(data);
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VolumeIndexEntry] {
        &self.entries
    }

    /// Serialize into the volume format.
    pub fn finish(self) -> Result<Vec<u8>> {
        let index_bytes = bincode::serialize(&self.entries)?;
        let index_offset = HEADER_LEN as u64;
        let data_offset = index_offset + index_bytes.len() as u64;
        let header = VolumeHeader::new(self.entries.len() as u32, index_offset, data_offset);
        let header_bytes = bincode::serialize(&header)?;
        debug_assert_eq!(header_bytes.len(), HEADER_LEN);

        let mut out = Vec::with_capacity(data_offset as usize + self.data.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&index_bytes);
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}
