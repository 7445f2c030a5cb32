//! Nearby test harness
//!
//! In-memory implementations of the radio capability traits plus a recording
//! delegate, so the engine can be exercised without Bluetooth hardware.

pub mod delegate;
pub mod radio;
pub mod transport;

pub use delegate::{Delivery, RecordingDelegate};
pub use radio::{MockConnector, MockRadio, MockRadioController, RadioOp};
pub use transport::{transport_pair, MockTransport, RemotePeer};
