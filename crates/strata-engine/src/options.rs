//! Runtime settings for a [`Controller`](crate::Controller).

use std::path::PathBuf;
use std::time::Duration;

use strata_config::Config;
use strata_crypto::KdfParams;

use crate::backend::RetryPolicy;
use crate::{EngineError, Result};

/// Everything an engine run needs, resolved from [`Config`] or built
/// directly.
#[derive(Debug, Clone)]
pub struct Options {
    /// Backend URL, see [`open_backend`](crate::backend::open_backend).
    pub target: String,
    pub prefix: String,
    pub catalog_dir: PathBuf,
    pub block_size: usize,
    pub volume_size: usize,
    pub upload_workers: usize,
    pub upload_queue: usize,
    pub error_threshold: u64,
    pub exclude: Vec<String>,
    pub keep_versions: Option<u32>,
    pub keep_time: Option<Duration>,
    /// `None` disables encryption.
    pub passphrase: Option<String>,
    pub kdf: KdfParams,
    pub retry: RetryPolicy,
    /// Message ids whose warnings the default log target reports as
    /// information.
    pub suppress_warnings: Vec<String>,
    /// Blocks digested in parallel per batch.
    pub hash_batch: usize,
    /// Re-read files whose size and mtime did not change.
    pub always_rehash: bool,
    /// How long to wait for another process holding the catalog.
    pub lock_timeout: Duration,
}

impl Options {
    pub fn new(target: impl Into<String>, catalog_dir: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            prefix: "strata".to_string(),
            catalog_dir: catalog_dir.into(),
            block_size: 100 * 1024,
            volume_size: 50 * 1024 * 1024,
            upload_workers: 2,
            upload_queue: 4,
            error_threshold: 100,
            exclude: Vec::new(),
            keep_versions: None,
            keep_time: None,
            passphrase: None,
            kdf: KdfParams::default(),
            retry: RetryPolicy::default(),
            suppress_warnings: Vec::new(),
            hash_batch: 16,
            always_rehash: false,
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Resolve a loaded configuration. Fails when encryption is enabled but
    /// the passphrase variable is unset.
    pub fn from_config(config: &Config) -> Result<Self> {
        let passphrase = if config.encryption.enabled {
            match config.encryption.passphrase() {
                Some(p) => Some(p),
                None => {
                    return Err(EngineError::InvalidRequest(format!(
                        "encryption is enabled but {} is not set",
                        config.encryption.passphrase_env
                    )))
                }
            }
        } else {
            None
        };

        let mut options = Self::new(&config.storage.target, config.storage.catalog_path());
        options.prefix = config.storage.prefix.clone();
        options.block_size = to_usize(config.backup.block_size_bytes()?, "backup.block_size")?;
        options.volume_size = to_usize(config.backup.volume_size_bytes()?, "backup.volume_size")?;
        options.upload_workers = config.backup.upload_workers();
        options.upload_queue = config.backup.upload_queue.max(1);
        options.error_threshold = config.backup.error_threshold;
        options.exclude = config.backup.exclude.clone();
        options.always_rehash = config.backup.always_rehash;
        options.keep_versions = config.retention.keep_versions;
        options.keep_time = config.retention.keep_time()?;
        options.passphrase = passphrase;
        options.retry = RetryPolicy::from(&config.retry);
        options.suppress_warnings = config.logging.suppress_warnings.clone();
        Ok(options)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_volume_size(mut self, volume_size: usize) -> Self {
        self.volume_size = volume_size;
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn without_encryption(mut self) -> Self {
        self.passphrase = None;
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_keep_versions(mut self, keep: u32) -> Self {
        self.keep_versions = Some(keep);
        self
    }

    pub fn with_keep_time(mut self, keep: Duration) -> Self {
        self.keep_time = Some(keep);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u64) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn with_upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers;
        self
    }

    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn with_always_rehash(mut self, always: bool) -> Self {
        self.always_rehash = always;
        self
    }

    pub fn with_suppressed_warning(mut self, message_id: impl Into<String>) -> Self {
        self.suppress_warnings.push(message_id.into());
        self
    }

    pub fn has_retention(&self) -> bool {
        self.keep_versions.is_some() || self.keep_time.is_some()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(EngineError::InvalidRequest("block size must be positive".into()));
        }
        if self.volume_size < self.block_size {
            return Err(EngineError::InvalidRequest(
                "volume size must be at least the block size".into(),
            ));
        }
        if self.prefix.is_empty()
            || !self
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EngineError::InvalidRequest(format!(
                "invalid prefix '{}'",
                self.prefix
            )));
        }
        if self.keep_versions == Some(0) {
            return Err(EngineError::InvalidRequest("keep_versions must be at least 1".into()));
        }
        Ok(())
    }
}

fn to_usize(value: u64, key: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| EngineError::InvalidRequest(format!("{key} is too large: {value}")))
}
