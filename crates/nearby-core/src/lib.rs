//! Nearby Core
//!
//! Foundational types for the Nearby BLE discovery engine: peer identities,
//! the fixed-width advertisement codec, session frames, configuration, error
//! types, the injected radio capability traits and the UI delegate interface.
//!
//! The engine itself lives in `nearby-runtime`; platform radios live in
//! `nearby-ble` and `nearby-harness`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod radio;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{DispatchConfig, EngineConfig, RegistryConfig, SchedulerConfig, SessionConfig};
pub use errors::{
    ConfigError, DecodeError, EngineError, NearbyError, NearbyResult, RadioError, SessionError,
    TransportError,
};
pub use events::{EngineEvent, PeerDelegate, RadioState};
pub use radio::{Connector, Radio, RadioEvent, RawAdvertisement, Transport};
pub use types::{
    Coordinate, DeviceHandle, IdentityToken, Message, PeerId, PeerIdentity, PeerRecord,
    PeerSighting, PeerSnapshot, SessionState, SystemTimeSource, TimeSource, Timestamp,
};
