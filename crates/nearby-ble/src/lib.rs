//! Bluetooth Low Energy radio for the Nearby discovery engine
//!
//! This crate provides [`BleRadio`], an implementation of the `Radio`
//! capability from `nearby-core` backed by the host Bluetooth stack.
//!
//! ## Architecture
//!
//! - [`config`] - Radio configuration and settings
//! - [`error`] - Error types specific to the BLE radio
//! - [`protocol`] - Service UUIDs and frame chunking over GATT
//! - `discovery` - Adapter setup and advertisement scanning (central role)
//! - `connection` - Outbound GATT connections and their transport
//! - `advertising` - Advertising and inbound links (peripheral role)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nearby_ble::{BleRadio, BleRadioConfig};
//! use nearby_runtime::{EngineBuilder, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = BleRadio::new(BleRadioConfig::new());
//! let mut engine = EngineBuilder::new(radio)
//!     .with_config(EngineConfig::default())
//!     .with_display_name("alice")
//!     .build_and_start()
//!     .await?;
//!
//! // ...
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: scanning via btleplug, advertising and inbound GATT links via
//!   `bluer` and BlueZ
//! - **Other platforms**: scanning and outbound sessions only; the device is
//!   not discoverable

mod advertising;
pub mod config;
mod connection;
mod discovery;
pub mod error;
pub mod protocol;
mod radio;

// Public API exports
pub use advertising::{BleAdvertiser, PlatformAdvertiser};
pub use config::BleRadioConfig;
pub use connection::{BleConnector, GattTransport};
pub use error::BleError;
pub use protocol::{
    FrameAssembler, NEARBY_RX_CHARACTERISTIC_UUID, NEARBY_SERVICE_UUID,
    NEARBY_TX_CHARACTERISTIC_UUID,
};
pub use radio::BleRadio;

// Re-export the capability trait for convenience
pub use nearby_core::Radio;
