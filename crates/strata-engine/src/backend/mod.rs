//! Remote storage abstraction.
//!
//! The engine only needs four operations from a storage provider, all
//! keyed by a flat file name. `put` and `delete` must be idempotent so a
//! retried call is always safe. [`open_backend`] picks an implementation
//! from the target URL.

mod local;
mod memory;
mod retry;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use retry::{is_retryable_io, with_retry, RetryPolicy};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Remote file not found: {0}")]
    NotFound(String),

    /// Worth retrying: timeouts, dropped connections and the like.
    #[error("Transient backend failure: {0}")]
    Transient(io::Error),

    #[error("Backend I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid backend target: {0}")]
    InvalidTarget(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transient(_) => true,
            BackendError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A file as listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
}

/// Uniform put/get/list/delete capability over one storage location.
pub trait Backend: Send + Sync {
    /// Human-readable label for logs.
    fn name(&self) -> &str;

    /// Store `data` under `name`, replacing any existing file atomically.
    fn put(&self, name: &str, data: &[u8]) -> BackendResult<()>;

    fn get(&self, name: &str) -> BackendResult<Vec<u8>>;

    /// All files, sorted by name.
    fn list(&self) -> BackendResult<Vec<RemoteEntry>>;

    /// Remove `name`. Removing a missing file succeeds.
    fn delete(&self, name: &str) -> BackendResult<()>;
}

/// Resolve a target URL.
///
/// * `file:///abs/path`, `file://~/path` or a bare path: a local folder
/// * `memory://name`: a process-wide in-memory store shared by name
pub fn open_backend(target: &str) -> BackendResult<Arc<dyn Backend>> {
    let target = target.trim();
    if target.is_empty() {
        return Err(BackendError::InvalidTarget("empty target".to_string()));
    }
    if let Some(name) = target.strip_prefix("memory://") {
        if name.is_empty() {
            return Err(BackendError::InvalidTarget(target.to_string()));
        }
        return Ok(MemoryBackend::shared(name));
    }
    let path = match target.strip_prefix("file://") {
        Some(rest) => rest,
        None if target.contains("://") => {
            return Err(BackendError::InvalidTarget(format!(
                "unsupported scheme in '{target}'"
            )))
        }
        None => target,
    };
    let root = strata_config::path::expand_tilde(PathBuf::from(path));
    Ok(Arc::new(LocalBackend::open(root)?))
}
