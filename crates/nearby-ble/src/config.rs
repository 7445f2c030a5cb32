//! BLE radio configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE radio
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleRadioConfig {
    /// Index of the adapter to use when several are present
    pub adapter_index: usize,
    /// Maximum time to wait for a GATT connection and service discovery
    pub connection_timeout_ms: u64,
    /// Bytes per characteristic write or notification (ATT MTU minus headers)
    pub chunk_size: usize,
    /// Largest reassembled frame accepted from a remote device
    pub max_frame_size: usize,
    /// Capacity of the radio event channel handed to the engine
    pub event_queue: usize,
}

impl Default for BleRadioConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            connection_timeout_ms: 5_000,
            chunk_size: 180, // Fits the common 185-byte ATT MTU
            max_frame_size: 4096,
            event_queue: 256,
        }
    }
}

impl BleRadioConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the adapter by index
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Set the write/notification chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the largest accepted frame
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = BleRadioConfig::new()
            .with_adapter_index(1)
            .with_connection_timeout(Duration::from_millis(2_500))
            .with_max_frame_size(1024);
        assert_eq!(config.adapter_index, 1);
        assert_eq!(config.connection_timeout_ms, 2_500);
        assert_eq!(config.connection_timeout(), Duration::from_millis(2_500));
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.chunk_size, BleRadioConfig::default().chunk_size);
    }
}
