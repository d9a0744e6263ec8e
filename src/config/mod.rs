//! Configuration management for the RFB-TV client.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

fn default_base_store_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_manufacturer() -> String {
    "generic".to_string()
}

fn default_model() -> String {
    "stb".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// RFB-TV session manager URL (rfbtv:// or rfbtvs://)
    pub session_manager_url: String,

    /// MAC address identifying this client
    #[serde(default)]
    pub mac_address: String,

    /// Base path for persistent client state (cookie, DRM files)
    #[serde(default = "default_base_store_path")]
    pub base_store_path: PathBuf,

    /// RFB-TV specific settings
    #[serde(default)]
    pub rfbtv: RfbtvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfbtvConfig {
    /// Application URL passed on session setup
    #[serde(default)]
    pub app_url: String,

    /// Screen resolution as WxH
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Client manufacturer, first part of the client id
    #[serde(default = "default_manufacturer")]
    pub client_manufacturer: String,

    /// Client model, second part of the client id
    #[serde(default = "default_model")]
    pub client_model: String,

    /// CA bundle for rfbtvs connections
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS
    #[serde(default)]
    pub ca_client_path: Option<PathBuf>,

    /// Private key matching the client certificate
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Local UDP URL used in RFB-TV 1.3 stream setup responses
    #[serde(default)]
    pub stream_forward_url: String,

    /// Additional session setup parameters
    #[serde(default)]
    pub setup_params: BTreeMap<String, String>,
}

impl Default for RfbtvConfig {
    fn default() -> Self {
        RfbtvConfig {
            app_url: String::new(),
            resolution: default_resolution(),
            client_manufacturer: default_manufacturer(),
            client_model: default_model(),
            ca_path: None,
            ca_client_path: None,
            private_key_path: None,
            stream_forward_url: String::new(),
            setup_params: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    BadResolution(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Cannot read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "Cannot parse configuration: {}", e),
            ConfigError::BadResolution(s) => write!(f, "Illegal resolution: {:?}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&text).map_err(ConfigError::Parse)
    }

    /// `WxH` resolution string as a pair.
    pub fn resolution(&self) -> Result<(u16, u16), ConfigError> {
        let bad = || ConfigError::BadResolution(self.rfbtv.resolution.clone());
        let (width, height) = self.rfbtv.resolution.split_once('x').ok_or_else(bad)?;
        Ok((
            width.trim().parse().map_err(|_| bad())?,
            height.trim().parse().map_err(|_| bad())?,
        ))
    }

    /// Unique client id derived from the MAC address.
    pub fn unique_id(&self) -> String {
        self.mac_address
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_lowercase()
    }
}
