//! Values stored in the catalog databases.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_cas::BlockDigest;

/// Lifecycle of a fileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesetStatus {
    /// A backup is still writing into this fileset. Hidden from listings.
    InProgress,
    /// The backup ran to completion with no failed file.
    Full,
    /// The backup was stopped early or some files failed.
    Partial,
}

impl FilesetStatus {
    pub fn is_committed(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for FilesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "in-progress",
            Self::Full => "full",
            Self::Partial => "partial",
        })
    }
}

/// One backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetRecord {
    pub version: u64,
    pub created: DateTime<Utc>,
    pub status: FilesetStatus,
    pub file_count: u64,
    /// Sum of logical file sizes.
    pub total_size: u64,
    pub failed_files: u64,
}

/// A file as recorded in one fileset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: Option<i64>,
    /// Block digests in file order. Repeats are allowed.
    pub blocks: Vec<BlockDigest>,
}

/// A stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub size: u64,
    pub volume: String,
    /// Number of (file entry, block position) pairs pointing at this block.
    pub refs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    /// Blocks were assigned but the upload has not been confirmed.
    Pending,
    Uploaded,
    Verified,
    /// Every block is dead; remote deletion is due.
    Deleting,
}

impl VolumeState {
    /// Safe to reference from a committed fileset.
    pub fn is_durable(self) -> bool {
        matches!(self, Self::Uploaded | Self::Verified)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Verified => "verified",
            Self::Deleting => "deleting",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub state: VolumeState,
    /// Size of the uploaded file; zero until known.
    pub size: u64,
    pub block_count: u64,
}
