//! # Configuration
//!
//! Loads the service configuration from a TOML file. The file lives in
//! `~/.remoteswitch/config.toml` unless `REMOTESWITCH_CONFIG` points somewhere
//! else, and a default file is written the first time the service starts so
//! that the user has something to edit.
//!
//! Missing sections and fields fall back to their defaults; values that are
//! present but unusable (empty topics, QoS 3, zero intervals) are rejected at
//! startup rather than discovered later.

use crate::mqtt::config::MqttConfig;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn, Level};

const CONFIG_DIR: &str = ".remoteswitch";
const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_ENV: &str = "REMOTESWITCH_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    #[default]
    Gpio,
    /// Logs state changes instead of driving a pin
    Simulated,
}

/// Output line settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ActuatorConfig {
    pub kind: ActuatorKind,
    /// BCM pin number
    pub pin: u8,
    /// Drive the pin low for `On`
    pub active_low: bool,
    /// Restore the pin to its previous mode when the service exits
    pub reset_on_exit: bool,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            kind: ActuatorKind::Gpio,
            pin: 2,
            active_low: false,
            reset_on_exit: true,
        }
    }
}

/// Link monitoring settings.
///
/// Without an interface the link is assumed to be up for the whole lifetime of
/// the process.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            poll_interval_ms: 1000,
        }
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.level
            .parse::<Level>()
            .map_err(|_| ConfigError::Invalid(format!("Unknown log level '{}'", self.level)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub actuator: ActuatorConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.logging.level()?;

        if self.network.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "network.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if let Some(interface) = &self.network.interface {
            if interface.is_empty() || interface.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "network.interface '{}' is not an interface name",
                    interface
                )));
            }
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        Self::from_toml(&content)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;

        debug!("Configuration written to {}", path.display());
        Ok(())
    }

    /// Loads the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        if !exists {
            info!("No configuration found, creating default at {}", path.display());
            let config = Config::default();
            config.save(path).await?;
            return Ok(config);
        }

        Self::load(path).await
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }

        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
