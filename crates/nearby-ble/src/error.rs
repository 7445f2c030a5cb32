//! Error types for the BLE radio

use nearby_core::{RadioError, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE radio
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available: {0}")]
    AdapterNotAvailable(String),

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Radio not acquired")]
    NotAcquired,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Advertising failed: {0}")]
    Advertising(String),

    #[error("BLE error: {0}")]
    Central(#[from] btleplug::Error),

    #[cfg(target_os = "linux")]
    #[error("BlueZ error: {0}")]
    Bluez(#[from] bluer::Error),
}

impl BleError {
    /// Whether the error means the radio as a whole is gone
    pub fn is_fatal(&self) -> bool {
        match self {
            BleError::AdapterNotAvailable(_) | BleError::PermissionDenied => true,
            BleError::Central(btleplug::Error::PermissionDenied) => true,
            #[cfg(target_os = "linux")]
            BleError::Bluez(err) => matches!(
                err.kind,
                bluer::ErrorKind::NotReady | bluer::ErrorKind::NotAuthorized
            ),
            _ => false,
        }
    }
}

impl From<BleError> for RadioError {
    fn from(err: BleError) -> Self {
        if err.is_fatal() {
            RadioError::Unavailable(err.to_string())
        } else {
            RadioError::Operation(err.to_string())
        }
    }
}

impl From<BleError> for TransportError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::FrameTooLarge { size, max_size } => {
                TransportError::FrameTooLarge { size, max_size }
            }
            BleError::MalformedChunk(reason) => TransportError::InvalidFrame(reason),
            other => TransportError::ConnectFailed(other.to_string()),
        }
    }
}
