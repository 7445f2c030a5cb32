//! Nearby Runtime Engine
//!
//! This crate contains the discovery and session engine, including:
//! - `RoleScheduler`: the advertise/scan duty cycle that owns the radio
//! - `PeerRegistry`: the time-bounded set of visible peers
//! - `SessionManager` and the per-session tasks
//! - `EventDispatcher`: ordered delivery to UI delegates
//! - `Engine`: the handle UI code drives, built with `EngineBuilder`
//!
//! `nearby-core` provides the stable type and trait definitions; this crate
//! wires them together around a single worker task.

pub mod builder;
pub mod dispatcher;
mod engine;
pub mod managers;
pub mod registry;
pub mod scheduler;
pub mod tasks;

pub use builder::{Engine, EngineBuilder};
pub use dispatcher::{DeliveryContext, DispatchQueue, Enqueued, EventDispatcher, EventSink};
pub use engine::{EngineStats, RuntimeClock};
pub use managers::*;
pub use registry::{Observation, PeerRegistry, RegistryChange, RegistryStats, SIGNAL_SMOOTHING};
pub use scheduler::{ResumeState, Role, RoleScheduler, RoleTransition, SchedulerState, SchedulerStats};
pub use tasks::{CloseReason, InboundGrant, SessionCommand, SessionProgress, SessionReport};

// Re-export core types for convenience
pub use nearby_core::{
    Coordinate, EngineConfig, EngineError, EngineEvent, IdentityToken, Message, NearbyError,
    NearbyResult, PeerDelegate, PeerId, PeerIdentity, PeerRecord, PeerSnapshot, RadioState,
    SessionState, Timestamp,
};
