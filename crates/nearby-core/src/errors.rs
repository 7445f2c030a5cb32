//! Error types for the Nearby engine
//!
//! Each concern gets its own error enum; `NearbyError` unifies them for
//! callers that just want to propagate with `?`.

use thiserror::Error;

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Advertisement payload decode failures. Never fatal: the sighting is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Malformed advertisement payload: {reason}")]
    Malformed { reason: &'static str },
    #[error("Unsupported advertisement version {version}")]
    UnsupportedVersion { version: u8 },
}

impl DecodeError {
    pub(crate) fn malformed(reason: &'static str) -> Self {
        Self::Malformed { reason }
    }
}

/// Errors reported by the injected radio capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    /// Hardware missing, powered off or permission revoked
    #[error("Radio unavailable: {0}")]
    Unavailable(String),
    /// A single operation failed; the radio is still usable
    #[error("Radio operation failed: {0}")]
    Operation(String),
}

impl RadioError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RadioError::Unavailable(_))
    }
}

/// Errors on a per-peer transport. Only the affected session is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Transport closed by remote")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Session lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Handshake failed with peer {peer_id}: {reason}")]
    HandshakeFailed { peer_id: PeerId, reason: String },
    #[error("Inbound session rejected: {reason}")]
    Rejected { reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors returned to the UI from engine operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Peer {peer_id} has no active session")]
    PeerNotActive { peer_id: PeerId },
    #[error("Payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },
    #[error("Send queue full for peer {peer_id}")]
    SendQueueFull { peer_id: PeerId },
    #[error("Engine is not running")]
    NotRunning,
    #[error("Engine is already running")]
    AlreadyRunning,
    #[error("Bluetooth radio unavailable: {reason}")]
    RadioUnavailable { reason: String },
    #[error("Failed to start event delivery: {0}")]
    DeliveryFailed(String),
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Top-level error type for the Nearby engine
#[derive(Debug, Error)]
pub enum NearbyError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<RadioError> for EngineError {
    fn from(err: RadioError) -> Self {
        EngineError::RadioUnavailable {
            reason: err.to_string(),
        }
    }
}

pub type NearbyResult<T> = core::result::Result<T, NearbyError>;
