//! Session configuration
//!
//! Loaded from YAML with every field optional:
//!
//! ```yaml
//! endpoint_address: "192.168.1.100"
//! device_port: 50010
//! listen_port: 50011
//! send_interval_ms: 50
//! default_coms_mode: { can_send: true, can_receive: true }
//! keepalive_interval_ms: 1500
//! ```

use crate::controller::{
    DEFAULT_ENDPOINT_ADDRESS, DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_SEND_INTERVAL_MS,
};
use crate::protocol::{DEFAULT_DEVICE_PORT, DEFAULT_LISTEN_PORT};
use crate::types::ComsMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings a session is started with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Device IP address or host name
    pub endpoint_address: String,

    /// UDP port the device listens on
    pub device_port: u16,

    /// UDP port replies arrive on (0 = any free port)
    pub listen_port: u16,

    /// Tick period, clamped to 20..=5000 when applied
    pub send_interval_ms: u32,

    /// Mode of newly added sources
    pub default_coms_mode: ComsMode,

    /// Silence after which an otherwise idle tick sends a ping
    pub keepalive_interval_ms: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint_address: DEFAULT_ENDPOINT_ADDRESS.to_string(),
            device_port: DEFAULT_DEVICE_PORT,
            listen_port: DEFAULT_LISTEN_PORT,
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            default_coms_mode: ComsMode::TX,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
        }
    }
}

/// Default config file location
///
/// `<config dir>/soundscape-sync/sync.yaml`, falling back to the home
/// directory and then the working directory.
pub fn default_sync_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("soundscape-sync")
        .join("sync.yaml")
}

/// Load the session configuration from a YAML file
///
/// If the file doesn't exist, returns the defaults.
/// If the file exists but is invalid, logs a warning and returns the defaults.
pub fn load_sync_config(path: &Path) -> SyncConfig {
    if !path.exists() {
        log::info!("load_sync_config: {:?} doesn't exist, using defaults", path);
        return SyncConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<SyncConfig>(&contents) {
            Ok(config) => {
                log::info!(
                    "load_sync_config: Device {}:{}, replies on {}, interval {} ms",
                    config.endpoint_address,
                    config.device_port,
                    config.listen_port,
                    config.send_interval_ms
                );
                config
            }
            Err(e) => {
                log::warn!("load_sync_config: Failed to parse config: {}", e);
                SyncConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_sync_config: Failed to read config file: {}", e);
            SyncConfig::default()
        }
    }
}

/// Save the session configuration to a YAML file
///
/// Creates parent directories if they don't exist.
pub fn save_sync_config(config: &SyncConfig, path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize sync config to YAML")?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write sync config file: {:?}", path))?;

    log::info!("save_sync_config: Saved to {:?}", path);
    Ok(())
}
