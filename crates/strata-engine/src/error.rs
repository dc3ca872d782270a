//! Engine error taxonomy.

use std::io;

use thiserror::Error;

use strata_catalog::CatalogError;
use strata_crypto::CryptoError;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Catalog(CatalogError),

    #[error(transparent)]
    Cas(#[from] strata_cas::CasError),

    #[error(transparent)]
    Pack(#[from] strata_pack::PackError),

    #[error(transparent)]
    Crypto(CryptoError),

    #[error(transparent)]
    Config(#[from] strata_config::ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A backend call kept failing transiently until retries ran out.
    #[error("{operation} {name} failed after {attempts} attempts: {source}")]
    TransientBackend {
        operation: &'static str,
        name: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// Wrong passphrase or tampered remote data.
    #[error("Authentication failed for {0}: wrong passphrase or tampered data")]
    Authentication(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("{failed} files failed, more than the allowed {threshold}")]
    ErrorThresholdExceeded { failed: u64, threshold: u64 },

    #[error("Catalog is locked by another process: {0}")]
    Locked(String),

    /// The upload worker pool is gone; no further volume can be stored.
    #[error("Upload workers unavailable: {0}")]
    UploaderClosed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Malformed remote file {name}: {reason}")]
    MalformedRemote { name: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::ConsistencyViolation(msg) => EngineError::ConsistencyViolation(msg),
            other => EngineError::Catalog(other),
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailure => {
                EngineError::Authentication("remote data".to_string())
            }
            other => EngineError::Crypto(other),
        }
    }
}

impl EngineError {
    /// Whether the error ends the operation, as opposed to being recorded
    /// against a single file and skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::Io(_) | EngineError::Cas(strata_cas::CasError::Io(_))
        )
    }
}
