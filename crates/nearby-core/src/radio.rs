//! Platform BLE capabilities injected into the engine
//!
//! The engine never talks to a Bluetooth stack directly. A platform crate
//! (or the in-memory harness) implements these traits:
//!
//! - [`Radio`] - advertising, scanning and the event stream; owned by the role scheduler
//! - [`Connector`] - opens outbound connections; shared with session tasks
//! - [`Transport`] - a connected, frame-oriented link; owned by exactly one session

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{RadioError, TransportError};
use crate::types::DeviceHandle;

// ----------------------------------------------------------------------------
// Radio Events
// ----------------------------------------------------------------------------

/// Raw advertisement data observed while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    pub device: DeviceHandle,
    pub data: Vec<u8>,
    /// Signal strength in dBm
    pub rssi: i16,
}

/// Events pushed by the radio to the engine
pub enum RadioEvent {
    /// An advertisement carrying the Nearby service payload was seen
    Advertisement(RawAdvertisement),
    /// A remote central connected to our peripheral role
    Incoming(Box<dyn Transport>),
    /// The platform revoked background execution time
    BackgroundRevoked,
    /// Background execution time is available again
    BackgroundRestored,
    /// The adapter was powered off or disappeared
    PoweredOff,
    /// The adapter is powered again; the engine must be restarted explicitly
    PoweredOn,
}

impl fmt::Debug for RadioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioEvent::Advertisement(adv) => f.debug_tuple("Advertisement").field(adv).finish(),
            RadioEvent::Incoming(_) => f.write_str("Incoming"),
            RadioEvent::BackgroundRevoked => f.write_str("BackgroundRevoked"),
            RadioEvent::BackgroundRestored => f.write_str("BackgroundRestored"),
            RadioEvent::PoweredOff => f.write_str("PoweredOff"),
            RadioEvent::PoweredOn => f.write_str("PoweredOn"),
        }
    }
}

// ----------------------------------------------------------------------------
// Capability Traits
// ----------------------------------------------------------------------------

/// Frame-oriented connection to one remote peer
///
/// `recv` must be cancellation safe: the session task races it against its
/// command queue.
#[async_trait]
pub trait Transport: Send {
    /// Send one complete frame
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next complete frame; `Ok(None)` means the remote disconnected
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the underlying connection. Consumes the handle so it can only
    /// happen once.
    async fn close(self: Box<Self>);
}

/// Opens outbound connections to devices seen while scanning
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn Transport>, TransportError>;
}

/// The local radio: advertising (peripheral) and scanning (central) roles
#[async_trait]
pub trait Radio: Send {
    /// Acquire the radio resource before any other operation
    async fn acquire(&mut self) -> Result<(), RadioError>;

    /// Release the radio resource; no operation is issued afterwards
    async fn release(&mut self);

    /// Start (or replace) advertising with the given payload
    async fn start_advertising(&mut self, payload: &[u8]) -> Result<(), RadioError>;

    async fn stop_advertising(&mut self) -> Result<(), RadioError>;

    async fn start_scan(&mut self) -> Result<(), RadioError>;

    async fn stop_scan(&mut self) -> Result<(), RadioError>;

    /// Take the event stream. Returns `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<RadioEvent>>;

    /// Connector used by session tasks for outbound connections
    fn connector(&self) -> Arc<dyn Connector>;
}
