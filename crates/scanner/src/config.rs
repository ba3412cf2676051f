use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use library::DEFAULT_EXTENSIONS;
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_FILE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub version: u32,
    pub roots: Vec<String>,
    pub index_path: String,
    pub extensions: Vec<String>,
    pub recursive: bool,
    /// Seconds between periodic scans. 0 disables periodic scanning.
    pub scan_interval_secs: u64,
    pub scan_on_startup: bool,
    pub prune_genres: bool,
    pub file_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            roots: Vec::new(),
            index_path: "catalog.redb".to_string(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            recursive: true,
            scan_interval_secs: 60 * 60 * 24,
            scan_on_startup: true,
            prune_genres: true,
            file_timeout_secs: DEFAULT_FILE_TIMEOUT_SECS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl ScannerConfig {
    fn normalize(&mut self) {
        if self.version < CONFIG_VERSION {
            self.version = CONFIG_VERSION;
        }
        if self.index_path.trim().is_empty() {
            self.index_path = "catalog.redb".to_string();
        }
        self.roots.retain(|root| !root.trim().is_empty());
        self.extensions = self
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.extensions.is_empty() {
            self.extensions = DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect();
        }
        if self.file_timeout_secs == 0 {
            self.file_timeout_secs = DEFAULT_FILE_TIMEOUT_SECS;
        }
    }
}

/// Runtime view of the configuration, with paths resolved.
#[derive(Clone, Debug)]
pub struct ScanSettings {
    pub roots: Vec<PathBuf>,
    pub extensions: Vec<String>,
    pub recursive: bool,
    pub scan_interval: Option<Duration>,
    pub file_timeout: Duration,
    pub progress_interval: Duration,
}

impl ScanSettings {
    pub fn from_config(config_path: &Path, config: &ScannerConfig) -> Self {
        Self {
            roots: config
                .roots
                .iter()
                .map(|root| resolve_path(config_path, root.trim()))
                .collect(),
            extensions: config.extensions.clone(),
            recursive: config.recursive,
            scan_interval: match config.scan_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            file_timeout: Duration::from_secs(config.file_timeout_secs.max(1)),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        }
    }

    /// One-shot settings for the given roots, used by tools and tests.
    pub fn for_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            recursive: true,
            scan_interval: None,
            file_timeout: Duration::from_secs(DEFAULT_FILE_TIMEOUT_SECS),
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("MEDIASCAN_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ScannerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ScannerConfig = serde_yaml::from_str(&contents)?;
        config.normalize();
        return Ok((config, false));
    }

    let config = ScannerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ScannerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}
