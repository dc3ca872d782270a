//! Named remote files for one configuration.
//!
//! Every file this configuration writes starts with `{prefix}-`, which is
//! what keeps several configurations apart on a shared target. Volumes are
//! `{prefix}-b{id}.dblock`; file lists, one per committed version, are
//! `{prefix}-{YYYYMMDDTHHMMSSZ}-v{version}.dlist`. Both get a `.enc`
//! suffix when encryption is on.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use strata_cas::BlockDigest;
use strata_catalog::{FileRecord, FilesetRecord, FilesetStatus};
use strata_crypto::{CryptoError, PassphraseCipher};
use strata_pack::{is_volume_name, VolumeReader};

use crate::backend::{with_retry, Backend, BackendError, RetryPolicy};
use crate::{EngineError, Result};

const ENCRYPTED_SUFFIX: &str = ".enc";
const FILE_LIST_EXT: &str = ".dlist";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// What a remote file name says about its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteFileKind {
    /// A block volume; `volume` is the name the catalog knows it by.
    Volume { volume: String },
    FileList { version: u64, created: DateTime<Utc> },
    /// Carries this configuration's prefix but no recognised layout.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
    pub encrypted: bool,
    pub kind: RemoteFileKind,
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            RemoteFileKind::Volume { .. } => "volume".to_string(),
            RemoteFileKind::FileList { version, .. } => format!("file list v{version}"),
            RemoteFileKind::Unknown => "unknown".to_string(),
        };
        write!(f, "{} ({}, {} bytes)", self.name, kind, self.size)
    }
}

/// Serialized content of a `.dlist` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    pub version: u64,
    pub created: DateTime<Utc>,
    pub status: FilesetStatus,
    pub failed_files: u64,
    pub files: Vec<FileListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListEntry {
    pub path: String,
    pub size: u64,
    pub mtime: Option<i64>,
    /// Hex block digests in file order.
    pub blocks: Vec<String>,
}

impl FileList {
    pub fn new(record: &FilesetRecord, files: &[FileRecord]) -> Self {
        Self {
            version: record.version,
            created: record.created,
            status: record.status,
            failed_files: record.failed_files,
            files: files
                .iter()
                .map(|f| FileListEntry {
                    path: f.path.clone(),
                    size: f.size,
                    mtime: f.mtime,
                    blocks: f.blocks.iter().map(BlockDigest::to_hex).collect(),
                })
                .collect(),
        }
    }

    /// Catalog records equivalent to this list.
    pub fn into_records(self) -> Result<(FilesetRecord, Vec<FileRecord>)> {
        let mut files = Vec::with_capacity(self.files.len());
        let mut total_size = 0u64;
        for entry in self.files {
            let blocks = entry
                .blocks
                .iter()
                .map(|h| BlockDigest::from_hex(h))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            total_size += entry.size;
            files.push(FileRecord {
                path: entry.path,
                size: entry.size,
                mtime: entry.mtime,
                blocks,
            });
        }
        let record = FilesetRecord {
            version: self.version,
            created: self.created,
            status: self.status,
            file_count: files.len() as u64,
            total_size,
            failed_files: self.failed_files,
        };
        Ok((record, files))
    }
}

/// Backend access scoped to one configuration: naming, encryption, retry.
#[derive(Clone)]
pub struct RemoteStore {
    backend: Arc<dyn Backend>,
    cipher: Option<Arc<PassphraseCipher>>,
    retry: RetryPolicy,
    prefix: String,
}

impl RemoteStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        cipher: Option<Arc<PassphraseCipher>>,
        retry: RetryPolicy,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            cipher,
            retry,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Remote name of a volume the catalog calls `volume`.
    pub fn volume_remote_name(&self, volume: &str) -> String {
        self.with_suffix(volume.to_string())
    }

    pub fn file_list_name(&self, version: u64, created: DateTime<Utc>) -> String {
        self.with_suffix(format!(
            "{}-{}-v{}{}",
            self.prefix,
            created.format(TIMESTAMP_FORMAT),
            version,
            FILE_LIST_EXT
        ))
    }

    /// Upload a sealed volume. Returns the number of bytes stored remotely.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), level = "debug")]
    pub fn put_volume(&self, volume: &str, bytes: &[u8]) -> Result<u64> {
        let name = self.volume_remote_name(volume);
        let payload = self.seal(bytes)?;
        with_retry(&self.retry, "put", &name, || self.backend.put(&name, &payload))?;
        Ok(payload.len() as u64)
    }

    pub fn get_volume(&self, volume: &str) -> Result<VolumeReader> {
        let name = self.volume_remote_name(volume);
        let bytes = self.fetch(&name)?;
        VolumeReader::from_bytes(bytes).map_err(|e| EngineError::MalformedRemote {
            name,
            reason: e.to_string(),
        })
    }

    /// Delete a volume. A volume that is already gone counts as deleted.
    pub fn delete_volume(&self, volume: &str) -> Result<()> {
        let name = self.volume_remote_name(volume);
        self.delete(&name)
    }

    /// Upload (or overwrite) the file list of a committed version.
    pub fn put_file_list(&self, record: &FilesetRecord, files: &[FileRecord]) -> Result<String> {
        let name = self.file_list_name(record.version, record.created);
        let json = serde_json::to_vec(&FileList::new(record, files))?;
        let payload = self.seal(&json)?;
        with_retry(&self.retry, "put", &name, || self.backend.put(&name, &payload))?;
        debug!(file_list = %name, files = files.len(), "uploaded file list");
        Ok(name)
    }

    pub fn get_file_list(&self, name: &str) -> Result<FileList> {
        let bytes = self.fetch(name)?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::MalformedRemote {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn delete_file_list(&self, version: u64, created: DateTime<Utc>) -> Result<()> {
        let name = self.file_list_name(version, created);
        self.delete(&name)
    }

    /// Remote files carrying this configuration's prefix, sorted by name.
    pub fn list(&self) -> Result<Vec<RemoteFile>> {
        let label = self.backend.name().to_string();
        let entries = with_retry(&self.retry, "list", &label, || self.backend.list())?;
        let own = format!("{}-", self.prefix);
        Ok(entries
            .into_iter()
            .filter(|e| e.name.starts_with(&own))
            .map(|e| {
                let encrypted = e.name.ends_with(ENCRYPTED_SUFFIX);
                let kind = self.classify(&e.name);
                RemoteFile {
                    name: e.name,
                    size: e.size,
                    encrypted,
                    kind,
                }
            })
            .collect())
    }

    fn classify(&self, name: &str) -> RemoteFileKind {
        if is_volume_name(&self.prefix, name) {
            let volume = name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(name);
            return RemoteFileKind::Volume {
                volume: volume.to_string(),
            };
        }
        match parse_file_list_name(&self.prefix, name) {
            Some((version, created)) => RemoteFileKind::FileList { version, created },
            None => RemoteFileKind::Unknown,
        }
    }

    fn with_suffix(&self, name: String) -> String {
        if self.cipher.is_some() {
            name + ENCRYPTED_SUFFIX
        } else {
            name
        }
    }

    fn seal(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) => Ok(cipher.encrypt(bytes)?),
            None => Ok(bytes.to_vec()),
        }
    }

    fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let payload = with_retry(&self.retry, "get", name, || self.backend.get(name))?;
        match &self.cipher {
            Some(cipher) => cipher.decrypt(&payload).map_err(|e| match e {
                CryptoError::AuthenticationFailure => EngineError::Authentication(name.to_string()),
                other => other.into(),
            }),
            None => Ok(payload),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        match with_retry(&self.retry, "delete", name, || self.backend.delete(name)) {
            Ok(()) | Err(EngineError::Backend(BackendError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parse `{prefix}-{timestamp}-v{version}.dlist[.enc]`.
pub fn parse_file_list_name(prefix: &str, name: &str) -> Option<(u64, DateTime<Utc>)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(rest);
    let rest = rest.strip_suffix(FILE_LIST_EXT)?;
    let (stamp, version) = rest.split_once("-v")?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = version.parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((version, Utc.from_utc_datetime(&naive)))
}
