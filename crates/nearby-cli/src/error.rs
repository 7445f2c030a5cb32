//! Error handling for the Nearby CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Nearby error: {0}")]
    Nearby(#[from] nearby_core::NearbyError),

    #[error("Engine error: {0}")]
    Engine(#[from] nearby_core::EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<nearby_core::ConfigError> for CliError {
    fn from(err: nearby_core::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}
