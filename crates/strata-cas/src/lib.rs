//! # strata-cas
//!
//! Content addressing for Strata.
//!
//! Every block of file content is identified by the BLAKE3 digest of its
//! plaintext bytes. Two blocks with equal digests are treated as equal
//! content; this is the dedup key used by the catalog and the packer.
//!
//! Splitting is fixed-size and deterministic: the same input and block size
//! always produce the same boundaries, which is what restore relies on to
//! reassemble identical byte layouts.

mod splitter;

pub use splitter::{Block, BlockSplitter, Blocks, DigestedBlock};

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

/// Length of a block digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Errors that can occur while splitting or addressing content
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// BLAKE3 digest of a block's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockDigest(pub [u8; DIGEST_LEN]);

impl BlockDigest {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| CasError::InvalidDigest(format!("expected {} bytes, got {}", DIGEST_LEN, bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CasError::InvalidDigest(format!("{}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Check `data` against this digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = digest(data);
        if actual != *self {
            return Err(CasError::DigestMismatch {
                expected: self.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockDigest({})", self.short())
    }
}

impl FromStr for BlockDigest {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Compute the digest of a byte slice.
#[inline]
pub fn digest(data: &[u8]) -> BlockDigest {
    BlockDigest(*blake3::hash(data).as_bytes())
}

/// Stream a file through the hasher without loading it whole.
#[instrument(level = "debug")]
pub fn digest_file(path: &Path) -> Result<BlockDigest> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(BlockDigest(*hasher.finalize().as_bytes()))
}
