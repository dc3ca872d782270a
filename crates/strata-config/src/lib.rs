//! # strata-config
//!
//! Configuration management for Strata.
//!
//! Loads configuration from:
//! 1. `~/.strata/config.toml` (global)
//! 2. `.strata/config.toml` (project-local, overrides global key by key)
//! 3. `STRATA_*` environment variables (highest priority)

pub mod logging;
pub mod path;
mod units;

pub use logging::LogLevel;
pub use units::{parse_duration, parse_size};

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Replace the global config, e.g. with one loaded from an explicit file.
pub fn install(config: Config) {
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = config;
}

/// Reload config from the standard locations
pub fn reload() -> Result<(), ConfigError> {
    install(Config::load()?);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub retention: RetentionConfig,
    pub encryption: EncryptionConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        if let Some(global) = Self::global_config_path() {
            layers.push(global);
        }
        layers.push(PathBuf::from(".strata/config.toml"));

        let mut config = Self::load_layers(&layers)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load one explicit file over the defaults, then apply the environment.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        let mut config = Self::load_layers(&[path.to_path_buf()])?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Merge the given files in order; missing files are skipped.
    ///
    /// Later files override earlier ones per key, so a project file that only
    /// sets `backup.block_size` keeps everything else from the global file.
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in paths {
            if path.exists() {
                debug!("Loading config layer from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let layer: toml::Value = toml::from_str(&contents)?;
                merge_values(&mut merged, layer);
            }
        }
        let config: Config = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.strata/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".strata/config.toml"))
    }

    /// Apply `STRATA_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(target) = lookup("STRATA_TARGET") {
            self.storage.target = target;
        }
        if let Some(prefix) = lookup("STRATA_PREFIX") {
            self.storage.prefix = prefix;
        }
        if let Some(catalog) = lookup("STRATA_CATALOG") {
            self.storage.catalog = PathBuf::from(catalog);
        }
        if let Some(size) = lookup("STRATA_BLOCK_SIZE") {
            self.backup.block_size = size;
        }
        if let Some(size) = lookup("STRATA_VOLUME_SIZE") {
            self.backup.volume_size = size;
        }
        if let Some(workers) = lookup("STRATA_UPLOAD_WORKERS") {
            let n = workers.parse().map_err(|_| {
                ConfigError::Invalid(format!("STRATA_UPLOAD_WORKERS is not a number: {workers}"))
            })?;
            self.backup.upload_workers = Some(n);
        }
        if let Some(level) = lookup("STRATA_LOG_LEVEL") {
            self.logging.level = level.parse()?;
        }
        self.validate()
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Config::default().to_toml().unwrap_or_default()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.storage.prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "storage.prefix must be non-empty and use [A-Za-z0-9_-]: '{prefix}'"
            )));
        }
        let block = self.backup.block_size_bytes()?;
        if block == 0 {
            return Err(ConfigError::Invalid("backup.block_size must be positive".into()));
        }
        if self.backup.volume_size_bytes()? < block {
            return Err(ConfigError::Invalid(
                "backup.volume_size must be at least backup.block_size".into(),
            ));
        }
        if self.retention.keep_versions == Some(0) {
            return Err(ConfigError::Invalid(
                "retention.keep_versions must be at least 1".into(),
            ));
        }
        self.retention.keep_time()?;
        Ok(())
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Where backups go and where local state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend URL: `file:///path` or `memory://name`
    pub target: String,
    /// Remote file-name prefix; separates configurations sharing a target
    pub prefix: String,
    /// Local catalog directory
    pub catalog: PathBuf,
}

impl StorageConfig {
    pub fn catalog_path(&self) -> PathBuf {
        path::expand_tilde(&self.catalog)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            target: "file://~/.strata/remote".to_string(),
            prefix: "strata".to_string(),
            catalog: PathBuf::from("~/.strata/catalog"),
        }
    }
}

/// Backup tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub block_size: String,
    pub volume_size: String,
    /// Number of upload threads (None = one per CPU)
    pub upload_workers: Option<usize>,
    /// Sealed volumes buffered ahead of the uploaders
    pub upload_queue: usize,
    /// Failed files tolerated before the run is abandoned
    pub error_threshold: u64,
    /// Path patterns to skip (`*` wildcard)
    pub exclude: Vec<String>,
    /// Re-read files even when size and mtime match the previous version
    pub always_rehash: bool,
}

impl BackupConfig {
    pub fn block_size_bytes(&self) -> Result<u64, ConfigError> {
        parse_size(&self.block_size)
    }

    pub fn volume_size_bytes(&self) -> Result<u64, ConfigError> {
        parse_size(&self.volume_size)
    }

    pub fn upload_workers(&self) -> usize {
        self.upload_workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            block_size: "100kb".to_string(),
            volume_size: "50mb".to_string(),
            upload_workers: None,
            upload_queue: 4,
            error_threshold: 100,
            exclude: Vec::new(),
            always_rehash: false,
        }
    }
}

/// Automatic deletion of old versions after a full backup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Keep this many full versions
    pub keep_versions: Option<u32>,
    /// Delete versions older than this, e.g. "30d"
    pub keep_time: Option<String>,
}

impl RetentionConfig {
    pub fn keep_time(&self) -> Result<Option<Duration>, ConfigError> {
        self.keep_time.as_deref().map(parse_duration).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Environment variable that holds the passphrase
    pub passphrase_env: String,
}

impl EncryptionConfig {
    pub fn passphrase(&self) -> Option<String> {
        std::env::var(&self.passphrase_env).ok().filter(|p| !p.is_empty())
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            passphrase_env: "STRATA_PASSPHRASE".to_string(),
        }
    }
}

/// Backoff for transient backend errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 200,
            retry_max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub log_file: Option<PathBuf>,
    /// Message ids whose warnings are reported as information
    pub suppress_warnings: Vec<String>,
}
