//! Client configuration.
//!
//! Read from a TOML file with three sections:
//!
//! ```toml
//! [uptane]
//! primary_serial = "P0"
//! primary_hardware_id = "primary-hw"
//!
//! [storage]
//! path = "/var/lib/uptane"
//!
//! [[secondary.virtual]]
//! serial = "S1"
//! hardware_id = "ecu-a"
//! firmware_path = "/var/lib/uptane/s1.bin"
//! key_path = "/var/lib/uptane/s1.key"
//! ```
//!
//! Everything except the primary ECU identity has a default.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::security::validate_ecu_serial;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub uptane: UptaneConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub secondary: SecondaryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UptaneConfig {
    pub primary_serial: String,
    pub primary_hardware_id: String,
    /// Retries after the first failed attempt of a download.
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    #[serde(default = "default_command_poll_interval_ms")]
    pub command_poll_interval_ms: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_command_channel_capacity")]
    pub command_channel_capacity: usize,
    /// Hex seed of the primary's manifest signing key. Created when absent.
    #[serde(default = "default_primary_key_path")]
    pub primary_key_path: PathBuf,
}

fn default_download_retries() -> u32 {
    3
}

fn default_command_poll_interval_ms() -> u64 {
    1000
}

fn default_event_channel_capacity() -> usize {
    64
}

fn default_command_channel_capacity() -> usize {
    16
}

fn default_primary_key_path() -> PathBuf {
    PathBuf::from("primary.key")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecondaryConfig {
    #[serde(default, rename = "virtual")]
    pub virtuals: Vec<VirtualSecondaryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualSecondaryConfig {
    pub serial: String,
    pub hardware_id: String,
    pub firmware_path: PathBuf,
    pub key_path: PathBuf,
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_identity("primary", &self.uptane.primary_serial, &self.uptane.primary_hardware_id)?;
        if self.uptane.event_channel_capacity == 0 || self.uptane.command_channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be positive".to_string()));
        }

        let mut serials = vec![self.uptane.primary_serial.as_str()];
        for secondary in &self.secondary.virtuals {
            check_identity("secondary", &secondary.serial, &secondary.hardware_id)?;
            if serials.contains(&secondary.serial.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate ECU serial {}",
                    secondary.serial
                )));
            }
            serials.push(&secondary.serial);
        }
        Ok(())
    }
}

fn check_identity(what: &str, serial: &str, hardware_id: &str) -> Result<(), ConfigError> {
    if serial.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{} serial is empty", what)));
    }
    if hardware_id.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{} {} hardware id is empty",
            what, serial
        )));
    }
    validate_ecu_serial(serial)
        .map_err(|e| ConfigError::Invalid(format!("{} serial {:?}: {}", what, serial, e)))
}

/// Load and validate the config at `path`.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<ClientConfig> {
    let path = path.as_ref();
    let config = ClientConfig::from_file(path)
        .with_context(|| format!("loading client config from {}", path.display()))?;
    log::info!(
        "CONFIG_LOADED path={} primary={} secondaries={}",
        path.display(),
        config.uptane.primary_serial,
        config.secondary.virtuals.len()
    );
    Ok(config)
}
