//! Configuration handling for vpn-guard

use crate::connection::session::ConnectionParams;
use crate::dns::resolv::{DEFAULT_BACKUP_PATH, DEFAULT_RESOLV_PATH};
use crate::netchange::DELAY_BEFORE_NOTIFY;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "vpn-guard.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dns: DnsConfig,
    pub detector: DetectorConfig,
    pub transport: TransportConfig,
    pub split_tunnel: SplitTunnelSettings,
    /// Session to establish with `run`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<ConnectionParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub resolv_path: PathBuf,
    pub backup_path: PathBuf,
    /// Delay before an externally modified resolv.conf is rewritten
    pub settle_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            resolv_path: PathBuf::from(DEFAULT_RESOLV_PATH),
            backup_path: PathBuf::from(DEFAULT_BACKUP_PATH),
            settle_ms: 2000,
        }
    }
}

impl DnsConfig {
    pub fn settle_period(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Quiet period after the last route change before notifying
    pub debounce_ms: u64,
    /// Capacity of the route-change notification channel
    pub channel_depth: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DELAY_BEFORE_NOTIFY.as_millis() as u64,
            channel_depth: 1,
        }
    }
}

impl DetectorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// A zero-capacity channel cannot be created
    pub fn channel_capacity(&self) -> usize {
        self.channel_depth.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    /// Tunnel interface name, also the session file name
    pub interface: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("wg-quick"),
            config_dir: PathBuf::from("/etc/wireguard"),
            interface: "wgvpn".to_string(),
        }
    }
}

impl TransportConfig {
    /// Where the session configuration is written
    pub fn session_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitTunnelSettings {
    pub enabled: bool,
    /// Executables (full path or file name) that bypass the tunnel
    pub apps: Vec<String>,
    /// Outbound address of the physical interface, used for SNAT
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv6: Option<Ipv6Addr>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Per-user configuration file location
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vpn-guard").join("config.toml"))
}

/// Files searched when no path is given, in order
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    paths.extend(user_config_path());
    paths
}

/// Load the configuration.
///
/// An explicit path must exist. Otherwise the first existing file from
/// [`default_search_paths`] is used, falling back to defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    match explicit {
        Some(path) => Config::load(path),
        None => load_first_existing(&default_search_paths()),
    }
}

fn load_first_existing(paths: &[PathBuf]) -> Result<Config, ConfigError> {
    match paths.iter().find(|p| p.exists()) {
        Some(path) => {
            debug!("Loading config from {}", path.display());
            Config::load(path)
        }
        None => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}
