//! Configuration types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{DEFAULT_DHT_PORT, DEFAULT_LAN_BEACON_PORT, DEFAULT_RELAY_PORT};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write config: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(serde_json::Error),
}

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnonetConfig {
    /// Network settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Node settings
    #[serde(default)]
    pub node: NodeSettings,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// UDP port for the DHT listener
    #[serde(default = "default_dht_port")]
    pub dht_port: u16,

    /// TCP port for the onion relay
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// UDP port for LAN bootstrap beacons
    #[serde(default = "default_beacon_port")]
    pub lan_beacon_port: u16,

    /// Hard-coded bootstrap seeds (format: "ip:port")
    #[serde(default)]
    pub bootstrap_seeds: Vec<String>,

    /// Number of relay hops for new circuits
    #[serde(default = "default_hops")]
    pub circuit_hops: usize,
}

fn default_dht_port() -> u16 {
    DEFAULT_DHT_PORT
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

fn default_beacon_port() -> u16 {
    DEFAULT_LAN_BEACON_PORT
}

fn default_hops() -> usize {
    3
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            dht_port: default_dht_port(),
            relay_port: default_relay_port(),
            lan_beacon_port: default_beacon_port(),
            bootstrap_seeds: Vec::new(),
            circuit_hops: default_hops(),
        }
    }
}

/// Node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Directory holding keys, the mnemonic and the node cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Whether this node accepts relay traffic
    #[serde(default = "default_true")]
    pub run_relay: bool,

    /// Seconds between re-announcements
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".anonet")
}

fn default_true() -> bool {
    true
}

fn default_announce_interval() -> u64 {
    300
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            run_relay: default_true(),
            announce_interval_secs: default_announce_interval(),
        }
    }
}

impl AnonetConfig {
    /// Load settings from a path, or return defaults if the file is absent
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
            let config: AnonetConfig =
                serde_json::from_str(&content).map_err(ConfigError::ParseError)?;
            info!("Loaded config from {:?}", path);
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save settings to a path, creating parent directories as needed
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(ConfigError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::ParseError)?;
        std::fs::write(path, content).map_err(ConfigError::WriteError)?;
        info!("Saved config to {:?}", path);
        Ok(())
    }
}
