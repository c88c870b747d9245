//! RoleWarden configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WardenConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl WardenConfig {
    /// Load config from the default path (~/.rolewarden/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| WardenError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the RoleWarden home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rolewarden")
    }
}

/// Chat-platform API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".into()
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. Empty = ~/.rolewarden/warden.db.
    #[serde(default)]
    pub db_path: String,
    /// Bound on a single store call when the database is locked.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    /// How many connect attempts before the store is declared unavailable.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Fixed delay between connect attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

fn default_busy_timeout() -> u64 {
    5000
}
fn default_max_connect_attempts() -> u32 {
    5
}
fn default_reconnect_delay() -> u64 {
    5000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            busy_timeout_ms: default_busy_timeout(),
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl StorageConfig {
    /// Resolve the database path, falling back to the default location.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_empty() {
            WardenConfig::home_dir().join("warden.db")
        } else {
            PathBuf::from(&self.db_path)
        }
    }
}

/// Lifecycle scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poll tick interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// After this many failed role removals a temporary grant is stalled
    /// and surfaced for manual intervention instead of retried forever.
    #[serde(default = "default_max_removal_attempts")]
    pub max_removal_attempts: u32,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_max_removal_attempts() -> u32 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_removal_attempts: default_max_removal_attempts(),
        }
    }
}
