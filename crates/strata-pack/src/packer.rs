//! Packing blocks into volumes.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use strata_cas::BlockDigest;

use crate::{Result, VolumeWriter};

/// Remote file name for a new volume.
pub fn volume_file_name(prefix: &str) -> String {
    format!("{}-b{}.dblock", prefix, Uuid::new_v4().simple())
}

/// True if `name` is a volume written under exactly `prefix`.
pub fn is_volume_name(prefix: &str, name: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix).and_then(|r| r.strip_prefix("-b")) else {
        return false;
    };
    let rest = rest.strip_suffix(".enc").unwrap_or(rest);
    match rest.strip_suffix(".dblock") {
        Some(id) => id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// Where a block ended up after [`VolumePacker::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeAssignment {
    /// Newly appended to `volume`.
    Packed { volume: String },
    /// Already packed earlier in this session; nothing was appended.
    Existing { volume: String },
}

impl VolumeAssignment {
    pub fn volume(&self) -> &str {
        match self {
            Self::Packed { volume } | Self::Existing { volume } => volume,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Packed { .. })
    }
}

/// A finished volume, ready for upload. Never reopened.
#[derive(Debug)]
pub struct SealedVolume {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Digest and size of every block, in packing order.
    pub blocks: Vec<(BlockDigest, u64)>,
}

impl SealedVolume {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

struct OpenVolume {
    name: String,
    writer: VolumeWriter,
}

/// Batches blocks into volumes of roughly `target_size` bytes.
///
/// Blocks go into the open volume in insertion order. Once the open volume
/// reaches its target it can be sealed with [`flush_if_full`]; any
/// remainder is sealed by [`finalize_open_volume`].
///
/// [`flush_if_full`]: VolumePacker::flush_if_full
/// [`finalize_open_volume`]: VolumePacker::finalize_open_volume
pub struct VolumePacker {
    prefix: String,
    target_size: usize,
    open: Option<OpenVolume>,
    packed: HashMap<BlockDigest, String>,
}

impl VolumePacker {
    pub fn new(prefix: impl Into<String>, target_size: usize) -> Self {
        Self {
            prefix: prefix.into(),
            target_size: target_size.max(1),
            open: None,
            packed: HashMap::new(),
        }
    }

    /// Add a block, or report the volume it was already packed into.
    pub fn add(&mut self, digest: BlockDigest, data: &[u8]) -> VolumeAssignment {
        if let Some(volume) = self.packed.get(&digest) {
            return VolumeAssignment::Existing {
                volume: volume.clone(),
            };
        }

        let prefix = &self.prefix;
        let open = self.open.get_or_insert_with(|| OpenVolume {
            name: volume_file_name(prefix),
            writer: VolumeWriter::new(),
        });
        open.writer.add(digest, data);
        self.packed.insert(digest, open.name.clone());

        VolumeAssignment::Packed {
            volume: open.name.clone(),
        }
    }

    /// Volume that `digest` was packed into during this session.
    pub fn lookup(&self, digest: &BlockDigest) -> Option<&str> {
        self.packed.get(digest).map(String::as_str)
    }

    /// Seal the open volume if it has reached the target size.
    pub fn flush_if_full(&mut self) -> Result<Option<SealedVolume>> {
        let full = self
            .open
            .as_ref()
            .map(|v| v.writer.data_len() >= self.target_size)
            .unwrap_or(false);
        if full {
            self.seal()
        } else {
            Ok(None)
        }
    }

    /// Seal whatever is open, even if under target. `None` if nothing is open.
    pub fn finalize_open_volume(&mut self) -> Result<Option<SealedVolume>> {
        self.seal()
    }

    /// Name of the volume currently being filled.
    pub fn open_volume(&self) -> Option<&str> {
        self.open.as_ref().map(|v| v.name.as_str())
    }

    pub fn open_bytes(&self) -> usize {
        self.open.as_ref().map(|v| v.writer.data_len()).unwrap_or(0)
    }

    fn seal(&mut self) -> Result<Option<SealedVolume>> {
        let Some(open) = self.open.take() else {
            return Ok(None);
        };
        if open.writer.is_empty() {
            return Ok(None);
        }
        let blocks = open
            .writer
            .entries()
            .iter()
            .map(|e| (e.digest, e.length))
            .collect();
        let bytes = open.writer.finish()?;
        debug!(volume = %open.name, size = bytes.len(), "sealed volume");
        Ok(Some(SealedVolume {
            name: open.name,
            bytes,
            blocks,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VolumeReader;
    use strata_cas::digest;

    #[test]
    fn test_volume_names() {
        let name = volume_file_name("nightly");
        assert!(name.starts_with("nightly-b"));
        assert!(is_volume_name("nightly", &name));
        assert!(is_volume_name("nightly", &format!("{}.enc", name)));
        assert!(!is_volume_name("other", &name));
        assert!(!is_volume_name("nightly", "nightly-20240101T000000Z-v1.dlist"));
        // A prefix that extends another must not be mistaken for it.
        let longer = volume_file_name("nightly-b");
        assert!(!is_volume_name("nightly", &longer));
    }

    #[test]
    fn test_duplicate_block_short_circuits() {
        let mut packer = VolumePacker::new("t", 1 << 20);
        let d = digest(b"same");
        let first = packer.add(d, b"same");
        let second = packer.add(d, b"same");

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.volume(), second.volume());

        let sealed = packer.finalize_open_volume().unwrap().unwrap();
        assert_eq!(sealed.block_count(), 1);
    }

    #[test]
    fn test_flush_at_target_size() {
        let mut packer = VolumePacker::new("t", 100);
        packer.add(digest(&[1u8; 60]), &[1u8; 60]);
        assert!(packer.flush_if_full().unwrap().is_none());

        packer.add(digest(&[2u8; 60]), &[2u8; 60]);
        let sealed = packer.flush_if_full().unwrap().unwrap();
        assert_eq!(sealed.block_count(), 2);
        assert!(packer.open_volume().is_none());

        // The next block starts a fresh volume.
        let next = packer.add(digest(&[3u8; 10]), &[3u8; 10]);
        assert_ne!(next.volume(), sealed.name);
    }

    #[test]
    fn test_sealed_volume_keeps_insertion_order() {
        let mut packer = VolumePacker::new("t", 1 << 20);
        let blocks: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 10 + i as usize]).collect();
        for b in &blocks {
            packer.add(digest(b), b);
        }
        let sealed = packer.finalize_open_volume().unwrap().unwrap();

        let reader = VolumeReader::from_bytes(sealed.bytes).unwrap();
        for (entry, block) in reader.entries().iter().zip(&blocks) {
            assert_eq!(entry.digest, digest(block));
        }
        assert_eq!(sealed.blocks[4].1, 14);
    }

    #[test]
    fn test_finalize_with_nothing_open() {
        let mut packer = VolumePacker::new("t", 10);
        assert!(packer.finalize_open_volume().unwrap().is_none());
    }

    #[test]
    fn test_session_lookup_survives_sealing() {
        let mut packer = VolumePacker::new("t", 1);
        let d = digest(b"x");
        packer.add(d, b"x");
        let sealed = packer.flush_if_full().unwrap().unwrap();
        assert_eq!(packer.lookup(&d), Some(sealed.name.as_str()));
        assert_eq!(
            packer.add(d, b"x"),
            VolumeAssignment::Existing {
                volume: sealed.name
            }
        );
    }
}
