//! Configuration management for the note sync core.
//!
//! This module handles loading and saving configuration to/from a JSON file.
//! The config directory can be customized.
//!
//! Includes:
//! - device_id: UUID7 identifying this device (generated on first run)
//! - device_name: Human-readable device name
//! - sync: backend URL and queue tuning
//! - migration: defaults for the one-time account migration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NoteSyncError, NoteSyncResult};
use crate::migration::{ConflictPolicy, MigrationOptions, MigrationStrategy};
use crate::retry::RetryPolicy;
use crate::sync_queue::SyncSettings;

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the note API (empty until configured)
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base_url: String::new(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Migration defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_true")]
    pub backup_local: bool,
    /// "newer", "older" or "manual"
    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: String,
}

fn default_conflict_resolution() -> String {
    "newer".to_string()
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backup_local: true,
            conflict_resolution: default_conflict_resolution(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Device ID (UUID7 hex)
    #[serde(default = "generate_device_id")]
    pub device_id: String,
    /// Human-readable device name
    #[serde(default = "get_default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

fn generate_device_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn get_default_device_name() -> String {
    #[cfg(feature = "desktop")]
    {
        match hostname::get() {
            Ok(name) => format!("Notes on {}", name.to_string_lossy()),
            Err(_) => "Notes Device".to_string(),
        }
    }
    #[cfg(not(feature = "desktop"))]
    {
        "Notes Device".to_string()
    }
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            device_id: generate_device_id(),
            device_name: get_default_device_name(),
            sync: SyncConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without the `desktop` feature, `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> NoteSyncResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("notesync")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(NoteSyncError::Config(
                        "config_dir is required without the desktop feature".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("notes.db").to_string_lossy().to_string();
            default
        };

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Unreadable config file, using defaults");
                    default_data()
                }),
                Err(_) => default_data(),
            }
        } else {
            default_data()
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> NoteSyncResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the device ID
    pub fn device_id(&self) -> NoteSyncResult<Uuid> {
        Uuid::parse_str(&self.data.device_id)
            .map_err(|e| NoteSyncError::Config(format!("Invalid device_id: {}", e)))
    }

    /// Get the device ID as hex string
    pub fn device_id_hex(&self) -> &str {
        &self.data.device_id
    }

    /// Get the human-readable device name
    pub fn device_name(&self) -> &str {
        &self.data.device_name
    }

    /// Set the device name
    pub fn set_device_name(&mut self, name: &str) -> NoteSyncResult<()> {
        self.data.device_name = name.to_string();
        self.save()
    }

    /// Get sync configuration
    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.data.sync.enabled
    }

    pub fn set_sync_enabled(&mut self, enabled: bool) -> NoteSyncResult<()> {
        self.data.sync.enabled = enabled;
        self.save()
    }

    pub fn api_base_url(&self) -> &str {
        &self.data.sync.api_base_url
    }

    pub fn set_api_base_url(&mut self, url: &str) -> NoteSyncResult<()> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NoteSyncError::validation(
                "api_base_url",
                "must start with http:// or https://",
            ));
        }
        self.data.sync.api_base_url = url.to_string();
        self.save()
    }

    pub fn migration_config(&self) -> &MigrationConfig {
        &self.data.migration
    }

    /// Retry policy for gateway calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.data.sync.retry_attempts.max(1),
            Duration::from_millis(self.data.sync.retry_delay_ms),
        )
    }

    /// Queue settings derived from the sync section
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            batch_size: self.data.sync.batch_size.max(1),
            retry: self.retry_policy(),
            sync_interval: Duration::from_millis(self.data.sync.sync_interval_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.data.sync.request_timeout_secs)
    }

    /// Migration options from the configured defaults
    pub fn migration_options(&self) -> NoteSyncResult<MigrationOptions> {
        let conflict_resolution =
            ConflictPolicy::from_str(&self.data.migration.conflict_resolution).ok_or_else(|| {
                NoteSyncError::Config(format!(
                    "Invalid migration.conflict_resolution: {}",
                    self.data.migration.conflict_resolution
                ))
            })?;
        Ok(MigrationOptions {
            strategy: MigrationStrategy::Merge,
            conflict_resolution,
            backup_local: self.data.migration.backup_local,
        })
    }

    /// Get a config value by key (for CLI/UI)
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "device_id" => Some(self.data.device_id.clone()),
            "device_name" => Some(self.data.device_name.clone()),
            "sync.enabled" => Some(self.data.sync.enabled.to_string()),
            "sync.api_base_url" => Some(self.data.sync.api_base_url.clone()),
            "sync.batch_size" => Some(self.data.sync.batch_size.to_string()),
            "sync.retry_attempts" => Some(self.data.sync.retry_attempts.to_string()),
            "sync.retry_delay_ms" => Some(self.data.sync.retry_delay_ms.to_string()),
            "sync.sync_interval_ms" => Some(self.data.sync.sync_interval_ms.to_string()),
            "migration.backup_local" => Some(self.data.migration.backup_local.to_string()),
            "migration.conflict_resolution" => {
                Some(self.data.migration.conflict_resolution.clone())
            }
            _ => None,
        }
    }

    /// Set a config value by key (for CLI/UI)
    pub fn set(&mut self, key: &str, value: &str) -> NoteSyncResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> NoteSyncResult<T> {
            value
                .parse()
                .map_err(|_| NoteSyncError::validation(key, format!("invalid value '{}'", value)))
        }

        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "device_name" => self.data.device_name = value.to_string(),
            "sync.enabled" => self.data.sync.enabled = parse(key, value)?,
            "sync.api_base_url" => return self.set_api_base_url(value),
            "sync.batch_size" => self.data.sync.batch_size = parse(key, value)?,
            "sync.retry_attempts" => self.data.sync.retry_attempts = parse(key, value)?,
            "sync.retry_delay_ms" => self.data.sync.retry_delay_ms = parse(key, value)?,
            "sync.sync_interval_ms" => self.data.sync.sync_interval_ms = parse(key, value)?,
            "migration.backup_local" => self.data.migration.backup_local = parse(key, value)?,
            "migration.conflict_resolution" => {
                if ConflictPolicy::from_str(value).is_none() {
                    return Err(NoteSyncError::validation(
                        key,
                        "must be one of: newer, older, manual",
                    ));
                }
                self.data.migration.conflict_resolution = value.to_lowercase();
            }
            _ => return Err(NoteSyncError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}
