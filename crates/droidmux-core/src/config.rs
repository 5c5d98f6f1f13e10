//! Persistent configuration for droidmux.
//!
//! Stores user settings in `~/.droidmux/config.json`: the static device
//! endpoints to watch plus timing and service knobs for the registry and
//! gateway. Every field has a default, so a partial (or missing) file works.
//!
//! # Example
//!
//! ```no_run
//! use droidmux_core::config::DroidmuxConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = DroidmuxConfig::load();
//!
//! for endpoint in &config.endpoints {
//!     println!("watching {endpoint}");
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayConfig;
use crate::protocol::MAX_PAYLOAD;
use crate::registry::RegistryConfig;
use crate::transport::ConnectionConfig;

const CONFIG_DIRNAME: &str = ".droidmux";
const CONFIG_FILENAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns the droidmux directory (`~/.droidmux/`).
pub fn droidmux_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIRNAME))
        .ok_or(ConfigError::NoHomeDir)
}

/// Persistent droidmux configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidmuxConfig {
    /// Static `host:port` adbd endpoints to discover.
    pub endpoints: Vec<String>,
    /// Registry poll interval (default: 2000).
    pub poll_interval_ms: u64,
    /// Missed scans before a device is evicted (default: 3).
    pub eviction_threshold: u32,
    pub handshake_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// Largest payload advertised in CNXN.
    pub max_payload: u32,
    pub logcat_service: String,
    pub ui_dump_service: String,
}

impl Default for DroidmuxConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            endpoints: Vec::new(),
            poll_interval_ms: 2000,
            eviction_threshold: 3,
            handshake_timeout_ms: 5000,
            rpc_timeout_ms: 30_000,
            probe_timeout_ms: 5000,
            max_payload: MAX_PAYLOAD,
            logcat_service: gateway.logcat_service,
            ui_dump_service: gateway.ui_dump_service,
        }
    }
}

impl DroidmuxConfig {
    /// Path of the config file (`~/.droidmux/config.json`).
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(droidmux_dir()?.join(CONFIG_FILENAME))
    }

    /// Load config from `~/.droidmux/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::path()
            .and_then(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Load config from `path`, reporting read and parse errors.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save config to `~/.droidmux/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = droidmux_dir()?;
        std::fs::create_dir_all(&dir)?;
        self.save_to(&dir.join(CONFIG_FILENAME))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_payload: self.max_payload,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            ..ConnectionConfig::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            eviction_threshold: self.eviction_threshold,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            ..RegistryConfig::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            logcat_service: self.logcat_service.clone(),
            ui_dump_service: self.ui_dump_service.clone(),
        }
    }
}
