use crate::error::{Result, StrongboxError};
use crate::naming::{DEFAULT_EXTENSION, DEFAULT_PREFIX, NamingPolicy};
use crate::types::{BackendKind, BackupOption, BaseNodePeer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrongboxConfig {
    pub strongbox: StrongboxSettings,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Candidate base nodes, tried in this order.
    #[serde(default)]
    pub peers: Vec<BaseNodePeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrongboxSettings {
    /// Directory that gets backed up and restored. Empty means the engine's data directory.
    #[serde(default)]
    pub wallet_dir: String,
    /// Scratch root for temporary bundles. Keep it on the same filesystem as `wallet_dir`.
    pub scratch_dir: String,
    /// SQLite database holding per-option backup preferences.
    pub db_path: String,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_remote_folder")]
    pub remote_folder: String,
    /// Files that must be present in a bundle for restore to proceed.
    #[serde(default)]
    pub required_files: Vec<String>,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    /// Quiet period that collapses bursts of wallet events into one backup.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Remote archives kept per option after a successful backup (0 = keep all).
    #[serde(default = "default_retain_backups")]
    pub retain_backups: usize,
}

fn default_archive_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_remote_folder() -> String {
    "strongbox-backups".to_string()
}

fn default_compression_level() -> i32 {
    crate::archive::DEFAULT_COMPRESSION_LEVEL
}

fn default_schedule_interval_secs() -> u64 {
    3600
}

fn default_network_timeout_secs() -> u64 {
    60
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_retain_backups() -> usize {
    3
}

/// One storage backend bound to a backup option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub option: BackupOption,
    #[serde(rename = "type")]
    pub backend_type: BackendKind,
    /// Target folder for the local backend. When unset the folder is chosen during setup.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint URL for S3-compatible providers (MinIO, Garage, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Use path-style addressing. Default: true for S3Compatible, false for S3.
    #[serde(default)]
    pub path_style: Option<bool>,
    /// When both keys are unset the credential comes from interactive setup.
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_attempts_per_peer")]
    pub max_attempts_per_peer: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence from the engine during a scan before the round counts as failed.
    #[serde(default = "default_scan_stall_timeout_secs")]
    pub scan_stall_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_peer: default_max_attempts_per_peer(),
            connect_timeout_secs: default_connect_timeout_secs(),
            scan_stall_timeout_secs: default_scan_stall_timeout_secs(),
        }
    }
}

fn default_max_attempts_per_peer() -> u32 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_scan_stall_timeout_secs() -> u64 {
    120
}

impl StrongboxSettings {
    pub fn naming(&self) -> NamingPolicy {
        NamingPolicy::new(&self.archive_prefix, DEFAULT_EXTENSION)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl RecoveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn scan_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_stall_timeout_secs)
    }
}

impl StrongboxConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StrongboxError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| StrongboxError::TomlDe(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StrongboxError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.recovery.max_attempts_per_peer == 0 {
            return Err(StrongboxError::Config(
                "recovery.max_attempts_per_peer must be at least 1".to_string(),
            ));
        }
        if self.strongbox.schedule_interval_secs == 0 {
            return Err(StrongboxError::Config(
                "schedule_interval_secs must be at least 1".to_string(),
            ));
        }
        if !(1..=22).contains(&self.strongbox.compression_level) {
            return Err(StrongboxError::Config(format!(
                "compression_level {} is outside 1..=22",
                self.strongbox.compression_level
            )));
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if self.backends[..i].iter().any(|b| b.option == backend.option) {
                return Err(StrongboxError::Config(format!(
                    "More than one backend configured for option '{}'",
                    backend.option
                )));
            }
            if matches!(backend.backend_type, BackendKind::S3 | BackendKind::S3Compatible)
                && backend.bucket.as_deref().is_none_or(str::is_empty)
            {
                return Err(StrongboxError::Config(format!(
                    "Backend for option '{}' needs a bucket",
                    backend.option
                )));
            }
        }
        for peer in &self.peers {
            if peer.public_key_bytes()?.is_empty() {
                return Err(StrongboxError::Config(format!(
                    "Peer {} has an empty public key",
                    peer.address
                )));
            }
        }
        Ok(())
    }

    pub fn backend(&self, option: BackupOption) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.option == option)
    }

    /// Default config rooted at `base_dir`.
    pub fn default_config(base_dir: &Path) -> Self {
        Self {
            strongbox: StrongboxSettings {
                wallet_dir: base_dir.join("wallet").display().to_string(),
                scratch_dir: base_dir.join("scratch").display().to_string(),
                db_path: base_dir.join("strongbox.db").display().to_string(),
                archive_prefix: default_archive_prefix(),
                remote_folder: default_remote_folder(),
                required_files: vec![],
                compression_level: default_compression_level(),
                schedule_interval_secs: default_schedule_interval_secs(),
                network_timeout_secs: default_network_timeout_secs(),
                debounce_ms: default_debounce_ms(),
                retain_backups: default_retain_backups(),
            },
            backends: vec![BackendConfig {
                option: BackupOption::Local,
                backend_type: BackendKind::Local,
                path: Some(base_dir.join("backups").display().to_string()),
                bucket: None,
                region: None,
                endpoint_url: None,
                path_style: None,
                access_key: None,
                secret_key: None,
            }],
            recovery: RecoveryConfig::default(),
            peers: vec![],
        }
    }

    /// Resolve the config file path: `<base_dir>/strongbox.toml`
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join("strongbox.toml")
    }

    /// Resolve the default home directory: `~/.strongbox`
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".strongbox"))
            .ok_or_else(|| StrongboxError::Config("Cannot determine home directory".to_string()))
    }
}
