//! Nearby CLI Configuration Management
//!
//! The CLI reads one TOML document holding the local identity, the engine
//! tunables and the BLE radio settings. Missing sections and fields fall back
//! to defaults, so a file can be as small as:
//!
//! ```toml
//! [identity]
//! display_name = "alice"
//! ```
//!
//! Priority order: command line arguments > configuration file > defaults.
//! Without `--config`, the file is looked up at
//! `<platform config dir>/nearby/config.toml` and skipped when absent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use nearby_ble::BleRadioConfig;
use nearby_core::types::{MAX_DISPLAY_NAME_LEN, TOKEN_LEN};
use nearby_core::{Coordinate, EngineConfig};

use crate::cli::Cli;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the `nearby` binary
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// What this device advertises
    pub identity: IdentityConfig,

    /// Discovery engine tunables
    pub engine: EngineConfig,

    /// BLE radio settings
    pub ble: BleRadioConfig,

    /// Terminal front end settings
    pub cli: CliConfig,
}

/// Local identity advertised to nearby peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display name, at most 8 bytes of UTF-8
    pub display_name: String,

    /// Last-known location in degrees; both or neither must be set
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Terminal front end settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Prompt printed before each interactive command
    pub prompt: String,

    /// Name of the thread engine events are printed from
    pub delivery_thread: String,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: "nearby".to_string(),
            latitude: None,
            longitude: None,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            prompt: "nearby> ".to_string(),
            delivery_thread: "nearby-terminal".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load the configuration file and validate it
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_config_path().filter(|p| p.exists()) {
                Some(default_path) => Self::load_from_file(&default_path)?,
                None => {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Default configuration file location
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nearby").join("config.toml"))
    }

    /// Apply command line overrides on top of the loaded file
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(name) = &cli.name {
            self.identity.display_name = name.clone();
        }
        if cli.low_power {
            let low_power = EngineConfig::low_power();
            self.engine.scheduler = low_power.scheduler;
            self.engine.registry = low_power.registry;
        }
        if let Some(index) = cli.adapter {
            self.ble.adapter_index = index;
        }
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let name = &self.identity.display_name;
        if name.is_empty() {
            return Err(CliError::Config("Display name must not be empty".to_string()));
        }
        if name.len() > MAX_DISPLAY_NAME_LEN || name.contains('\0') {
            return Err(CliError::Config(format!(
                "Display name must be at most {} bytes without NUL characters, got {:?}",
                MAX_DISPLAY_NAME_LEN, name
            )));
        }

        match (self.identity.latitude, self.identity.longitude) {
            (None, None) => {}
            (Some(lat), Some(lon)) => {
                if Coordinate::from_degrees(lat, lon).is_none() {
                    return Err(CliError::Config(format!(
                        "Location out of range: {}, {}",
                        lat, lon
                    )));
                }
            }
            _ => {
                return Err(CliError::Config(
                    "Latitude and longitude must be set together".to_string(),
                ))
            }
        }

        self.engine.validate()?;

        // Notifications carry the destination token in front of each chunk
        if self.ble.chunk_size <= TOKEN_LEN {
            return Err(CliError::Config(format!(
                "BLE chunk size must exceed {} bytes",
                TOKEN_LEN
            )));
        }
        if self.ble.max_frame_size == 0 || self.ble.event_queue == 0 {
            return Err(CliError::Config(
                "BLE frame size and event queue must be greater than 0".to_string(),
            ));
        }
        if self.ble.max_frame_size < self.engine.session.max_payload_size {
            return Err(CliError::Config(
                "BLE max frame size must hold the largest message payload".to_string(),
            ));
        }
        Ok(())
    }

    /// Advertised location, if configured
    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.identity.latitude, self.identity.longitude) {
            (Some(lat), Some(lon)) => Coordinate::from_degrees(lat, lon),
            _ => None,
        }
    }

    /// Render the configuration as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a specific file, creating parent directories
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
