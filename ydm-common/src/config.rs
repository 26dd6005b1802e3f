//! Configuration loading
//!
//! Resolution order, highest priority first:
//! 1. Command-line overrides
//! 2. Environment variables (`YDM_*`)
//! 3. TOML config file (`--config`, `YDM_CONFIG`, or the user config dir)
//! 4. Compiled defaults
//!
//! A missing config file at the default location is not an error; the
//! service starts on compiled defaults with a warning.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Config, labels archive, images archive
const FETCHED_ARTIFACTS: u64 = 3;
/// Cap on the delay between two fetch attempts
const MAX_FETCH_BACKOFF_SECS: u64 = 30;
/// Lease headroom beyond downloads, for extraction and persistence
const LEASE_MARGIN_SECS: u64 = 30 * 60;

/// Blob store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Files under `storage.root`
    Local,
    /// Process memory, for tests and throwaway runs
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(Error::Config(format!("unknown storage backend '{}'", other))),
        }
    }
}

/// Job queue backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable lease-based queue in the service database
    Sqlite,
    /// In-process channel; deliveries are lost on restart
    Memory,
}

impl std::str::FromStr for QueueBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(QueueBackend::Sqlite),
            "memory" => Ok(QueueBackend::Memory),
            other => Err(Error::Config(format!("unknown queue backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root for the local backend; defaults to `{data_dir}/blobs`
    pub root: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    /// Visibility window of a delivery; must exceed worst-case job duration
    pub lease_seconds: u64,
    /// Idle sleep between empty polls
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Sqlite,
            lease_seconds: 12 * 60 * 60,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    /// Ceiling on all bytes of one dataset: the three downloads together,
    /// and separately the declared contents of both archives
    pub max_dataset_bytes: u64,
    /// Ceiling on one decompressed archive entry
    pub max_entry_bytes: u64,
    pub fetch_timeout_secs: u64,
    pub fetch_max_attempts: u32,
    pub fetch_initial_backoff_ms: u64,
    pub persist_max_attempts: u32,
    pub image_batch_size: usize,
    /// Fraction of attempted pairs that may be skipped before the job fails.
    /// Absent: fail only when no image succeeds.
    pub max_skip_ratio: Option<f64>,
    /// Scratch space for downloads; system temp dir when absent
    pub scratch_dir: Option<PathBuf>,
}

impl ImportSettings {
    /// Upper bound on the download step of one job: every artifact uses
    /// every attempt, each running to the timeout after a maximal backoff.
    pub fn worst_case_fetch_secs(&self) -> u64 {
        let attempts = u64::from(self.fetch_max_attempts.max(1));
        let per_artifact = attempts
            .saturating_mul(self.fetch_timeout_secs)
            .saturating_add((attempts - 1).saturating_mul(MAX_FETCH_BACKOFF_SECS));
        FETCHED_ARTIFACTS.saturating_mul(per_artifact)
    }
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_dataset_bytes: 100 * GIB,
            max_entry_bytes: 2 * GIB,
            fetch_timeout_secs: 3600,
            fetch_max_attempts: 3,
            fetch_initial_backoff_ms: 500,
            persist_max_attempts: 5,
            image_batch_size: 500,
            max_skip_ratio: None,
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Fully resolved service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub data_dir: PathBuf,
    /// Defaults to `{data_dir}/ydm.db`
    pub database_path: Option<PathBuf>,
    /// Concurrent worker loops
    pub workers: usize,
    pub storage: StorageSettings,
    pub queue: QueueSettings,
    pub import: ImportSettings,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5740".to_string(),
            data_dir: default_data_dir(),
            database_path: None,
            workers: 2,
            storage: StorageSettings::default(),
            queue: QueueSettings::default(),
            import: ImportSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Parse a TOML document; absent keys take compiled defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ydm.db"))
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("blobs"))
    }

    /// Reject settings no worker could run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.import.fetch_max_attempts == 0 {
            return Err(Error::Config(
                "import.fetch_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.import.persist_max_attempts == 0 {
            return Err(Error::Config(
                "import.persist_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.import.image_batch_size == 0 {
            return Err(Error::Config(
                "import.image_batch_size must be at least 1".to_string(),
            ));
        }
        if self.import.max_entry_bytes == 0 || self.import.max_dataset_bytes == 0 {
            return Err(Error::Config("import size ceilings must be positive".to_string()));
        }
        if let Some(ratio) = self.import.max_skip_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::Config(format!(
                    "import.max_skip_ratio must lie in [0, 1], got {}",
                    ratio
                )));
            }
        }
        if self.import.fetch_timeout_secs == 0 {
            return Err(Error::Config(
                "import.fetch_timeout_secs must be positive".to_string(),
            ));
        }
        // A lease that lapses mid-job hands the job to a second worker
        let required = self
            .import
            .worst_case_fetch_secs()
            .saturating_add(LEASE_MARGIN_SECS);
        if self.queue.lease_seconds < required {
            return Err(Error::Config(format!(
                "queue.lease_seconds is {} but downloads alone may take {} s; use at least {}",
                self.queue.lease_seconds,
                self.import.worst_case_fetch_secs(),
                required
            )));
        }
        Ok(())
    }
}

/// Values supplied on the command line; `None` falls through to lower layers
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub bind_address: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub log_level: Option<String>,
}

/// Resolve settings through every layer
pub fn load(overrides: &ConfigOverrides) -> Result<Settings> {
    let mut settings = load_file_layer(overrides.config_file.as_deref())?;
    apply_env(&mut settings)?;
    apply_overrides(&mut settings, overrides);
    settings.validate()?;
    Ok(settings)
}

/// Platform default config file, `~/.config/ydm/config.toml` on Linux
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ydm").join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("ydm"))
        .unwrap_or_else(|| PathBuf::from("./ydm_data"))
}

fn load_file_layer(explicit: Option<&Path>) -> Result<Settings> {
    let env_path = std::env::var_os("YDM_CONFIG").map(PathBuf::from);

    // Explicit paths must exist; the platform default is optional
    if let Some(path) = explicit.map(Path::to_path_buf).or(env_path) {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), "Loaded config file");
        return Settings::from_toml_str(&content);
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path)?;
            info!(path = %path.display(), "Loaded config file");
            Settings::from_toml_str(&content)
        }
        _ => {
            warn!("No config file found, using compiled defaults");
            Ok(Settings::default())
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn apply_env(settings: &mut Settings) -> Result<()> {
    if let Some(v) = env_value("YDM_BIND_ADDRESS") {
        settings.bind_address = v;
    }
    if let Some(v) = env_value("YDM_DATA_DIR") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Some(v) = env_value("YDM_DATABASE_PATH") {
        settings.database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env_value("YDM_WORKERS") {
        settings.workers = v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("YDM_WORKERS is not a number: '{}'", v)))?;
    }
    if let Some(v) = env_value("YDM_STORAGE_BACKEND") {
        settings.storage.backend = v.parse()?;
    }
    if let Some(v) = env_value("YDM_STORAGE_ROOT") {
        settings.storage.root = Some(PathBuf::from(v));
    }
    if let Some(v) = env_value("YDM_QUEUE_BACKEND") {
        settings.queue.backend = v.parse()?;
    }
    if let Some(v) = env_value("YDM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    Ok(())
}

fn apply_overrides(settings: &mut Settings, overrides: &ConfigOverrides) {
    if let Some(v) = &overrides.bind_address {
        settings.bind_address = v.clone();
    }
    if let Some(v) = &overrides.data_dir {
        settings.data_dir = v.clone();
    }
    if let Some(v) = &overrides.database_path {
        settings.database_path = Some(v.clone());
    }
    if let Some(v) = overrides.workers {
        settings.workers = v;
    }
    if let Some(v) = &overrides.log_level {
        settings.logging.level = v.clone();
    }
}
