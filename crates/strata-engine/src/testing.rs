//! Isolated directories for engine tests.
//!
//! ```ignore
//! use strata_engine::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! env.write_file("docs/a.bin", 64 * 1024, 1).unwrap();
//! let controller = Controller::open(env.options()).unwrap();
//! controller.backup(&[&env.source_dir]).unwrap();
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;

use strata_crypto::KdfParams;

use crate::backend::RetryPolicy;
use crate::options::Options;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

pub const TEST_PASSPHRASE: &str = "correct horse battery staple";

pub struct TestEnvironment {
    _temp_dir: TempDir,
    /// Files to back up
    pub source_dir: PathBuf,
    /// Local folder used as the backend
    pub target_dir: PathBuf,
    pub catalog_dir: PathBuf,
    pub restore_dir: PathBuf,
    pub test_id: u32,
}

impl TestEnvironment {
    pub fn new() -> io::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let source_dir = root.join("source");
        let target_dir = root.join("target");
        let catalog_dir = root.join("catalog");
        let restore_dir = root.join("restore");
        for dir in [&source_dir, &target_dir, &catalog_dir, &restore_dir] {
            fs::create_dir_all(dir)?;
        }

        Ok(Self {
            _temp_dir: temp_dir,
            source_dir,
            target_dir,
            catalog_dir,
            restore_dir,
            test_id,
        })
    }

    pub fn target_url(&self) -> String {
        format!("file://{}", self.target_dir.display())
    }

    /// Encrypted, small blocks and volumes, cheap key derivation, no
    /// retry delays.
    pub fn options(&self) -> Options {
        Options::new(self.target_url(), &self.catalog_dir)
            .with_block_size(4 * 1024)
            .with_volume_size(64 * 1024)
            .with_passphrase(TEST_PASSPHRASE)
            .with_kdf(KdfParams::light())
            .with_retry(RetryPolicy::immediate(2))
    }

    /// A second catalog directory in the same environment.
    pub fn catalog_dir_named(&self, name: &str) -> io::Result<PathBuf> {
        let dir = self.catalog_dir.with_file_name(format!("catalog-{name}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write `size` pseudo-random bytes derived from `seed`.
    pub fn write_file(&self, relative_path: &str, size: usize, seed: u64) -> io::Result<PathBuf> {
        let mut data = vec![0u8; size];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        self.write_bytes(relative_path, &data)
    }

    pub fn write_bytes(&self, relative_path: &str, content: &[u8]) -> io::Result<PathBuf> {
        let path = self.source_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Path under the source directory as the catalog stores it.
    pub fn catalog_key(&self, relative_path: &str) -> String {
        let canonical = fs::canonicalize(&self.source_dir).unwrap_or_else(|_| self.source_dir.clone());
        crate::backup::path_key(&canonical.join(relative_path))
    }

    /// Files currently in the backend folder.
    pub fn remote_files(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.target_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Compare two files byte for byte.
pub fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(fs::read(a)? == fs::read(b)?)
}
