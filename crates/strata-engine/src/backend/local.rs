//! Local folder backend.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::instrument;

use super::{Backend, BackendError, BackendResult, RemoteEntry};

/// Stores each remote file as a plain file in one directory.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    label: String,
}

impl LocalBackend {
    /// Open (creating if needed) a backend rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> BackendResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let label = format!("file://{}", root.display());
        Ok(Self { root, label })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> BackendResult<PathBuf> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(BackendError::InvalidTarget(format!(
                "invalid remote file name '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.label
    }

    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    fn put(&self, name: &str, data: &[u8]) -> BackendResult<()> {
        let path = self.path_for(name)?;
        // Dot-prefixed temp names are skipped by `list`.
        let temp_path = self.root.join(format!(
            ".{}.{}.{:?}.tmp",
            name,
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(BackendError::Io(e));
        }
        Ok(())
    }

    fn get(&self, name: &str) -> BackendResult<Vec<u8>> {
        let path = self.path_for(name)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackendError::NotFound(name.to_string()),
            _ => BackendError::Io(e),
        })
    }

    fn list(&self) -> BackendResult<Vec<RemoteEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            out.push(RemoteEntry {
                name,
                size: metadata.len(),
            });
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, name: &str) -> BackendResult<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(e)),
        }
    }
}
