//! Daemon configuration
//!
//! TOML-backed settings for the coordinator daemon, with working
//! defaults for every section.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::server::ServerConfig;
use crate::core::transport::SerialLinkConfig;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Coordinator settings.
    pub coordinator: ServerConfig,
    /// Serial link settings.
    pub serial: SerialLinkConfig,
    /// Gateway settings.
    pub gateway: GatewaySettings,
    /// Command multiplexer settings.
    pub mux: MuxSettings,
}

/// Gateway section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Identity prefix shared by this gateway's bus clients.
    pub prefix: String,
    /// This gateway's own bus-side identity.
    pub bus_id: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            prefix: "gw-".to_string(),
            bus_id: "gw-serial0".to_string(),
        }
    }
}

/// Command multiplexer section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    /// Bound on a correlated call, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config as TOML.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
