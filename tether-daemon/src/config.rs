//! Configuration loading for the TETHER daemon.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::SyncConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub remote: RemoteConfig,
    pub sync: SyncSection,
    pub contribution: ContributionSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Bearer credential issued during device registration. Overridable via
    /// `TETHER_AUTH_TOKEN`.
    pub auth_token: String,
    pub device_id: uuid::Uuid,
    /// Realtime endpoint; required when `sync.realtime_enabled` is true.
    pub ws_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    pub batch_size: usize,
    pub max_item_attempts: u32,
    pub cycle_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub realtime_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContributionSection {
    pub sample_interval_secs: u64,
    pub tick_interval_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or TETHER_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let mut config = Self::from_path(&path)?;
        if let Ok(token) = std::env::var("TETHER_AUTH_TOKEN") {
            config.remote.auth_token = token;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "remote.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.remote.auth_token.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "remote.auth_token",
                reason: "must not be empty".to_string(),
            });
        }
        if self.sync.realtime_enabled && self.remote.ws_endpoint.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "remote.ws_endpoint",
                reason: "required when sync.realtime_enabled is true".to_string(),
            });
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.cycle_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.cycle_interval_secs",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.request_timeout_secs",
                reason: "must be > 0".to_string(),
            });
        }
        if self.contribution.sample_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "contribution.sample_interval_secs",
                reason: "must be > 0".to_string(),
            });
        }
        if self.contribution.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "contribution.tick_interval_secs",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Engine configuration derived from the daemon sections.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.sync.batch_size,
            max_item_attempts: self.sync.max_item_attempts,
            cycle_interval: Duration::from_secs(self.sync.cycle_interval_secs),
            request_timeout: Duration::from_secs(self.sync.request_timeout_secs),
            realtime_enabled: self.sync.realtime_enabled,
            ..SyncConfig::default()
        }
    }
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os("TETHER_CONFIG").map(PathBuf::from)
}

// ============================================================================
// TESTS
// ============================================================================
