//! Events delivered to UI collaborators and the delegate interface they implement

use serde::{Deserialize, Serialize};

use crate::types::{Message, PeerId, PeerRecord, PeerSnapshot, SessionState, Timestamp};

// ----------------------------------------------------------------------------
// Radio State
// ----------------------------------------------------------------------------

/// Radio availability as surfaced to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    /// Advertising and scanning normally
    Running,
    /// Background execution revoked; discovery paused
    Suspended,
    /// Bluetooth disabled or missing; restart required
    Unavailable,
    /// Engine stopped
    Stopped,
}

// ----------------------------------------------------------------------------
// Engine Events
// ----------------------------------------------------------------------------

/// Events fanned out by the dispatcher
///
/// Peer events carry the registry snapshot taken right after the change, so a
/// delegate can redraw from the event alone.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerDiscovered {
        peer: PeerRecord,
        snapshot: PeerSnapshot,
    },
    PeerUpdated {
        peer: PeerRecord,
        snapshot: PeerSnapshot,
    },
    PeerLost {
        peer_id: PeerId,
        snapshot: PeerSnapshot,
    },
    SessionStateChanged {
        peer_id: PeerId,
        state: SessionState,
    },
    MessageReceived(Message),
    RadioStateChanged(RadioState),
}

impl EngineEvent {
    /// Only `PeerUpdated` may be replaced or evicted under backpressure
    pub fn is_coalescible(&self) -> bool {
        matches!(self, EngineEvent::PeerUpdated { .. })
    }

    /// Peer the event is about, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            EngineEvent::PeerDiscovered { peer, .. } | EngineEvent::PeerUpdated { peer, .. } => {
                Some(peer.peer_id)
            }
            EngineEvent::PeerLost { peer_id, .. }
            | EngineEvent::SessionStateChanged { peer_id, .. } => Some(*peer_id),
            EngineEvent::MessageReceived(message) => Some(message.sender),
            EngineEvent::RadioStateChanged(_) => None,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PeerDiscovered { .. } => "peer_discovered",
            EngineEvent::PeerUpdated { .. } => "peer_updated",
            EngineEvent::PeerLost { .. } => "peer_lost",
            EngineEvent::SessionStateChanged { .. } => "session_state_changed",
            EngineEvent::MessageReceived(_) => "message_received",
            EngineEvent::RadioStateChanged(_) => "radio_state_changed",
        }
    }
}

// ----------------------------------------------------------------------------
// Delegate Interface
// ----------------------------------------------------------------------------

/// Callback interface implemented by each UI collaborator
///
/// The dispatcher calls a delegate from exactly one execution context and in
/// emission order, so implementations need no extra ordering of their own.
pub trait PeerDelegate: Send + Sync {
    /// The visible peer set changed
    fn on_peers_changed(&self, snapshot: &[PeerRecord]);

    /// A chat message arrived
    fn on_message_received(&self, peer_id: PeerId, payload: &[u8], timestamp: Timestamp);

    fn on_session_state_changed(&self, _peer_id: PeerId, _state: SessionState) {}

    fn on_radio_state_changed(&self, _state: RadioState) {}

    /// Entry point used by the dispatcher; routes to the callbacks above
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PeerDiscovered { snapshot, .. }
            | EngineEvent::PeerUpdated { snapshot, .. }
            | EngineEvent::PeerLost { snapshot, .. } => self.on_peers_changed(snapshot),
            EngineEvent::SessionStateChanged { peer_id, state } => {
                self.on_session_state_changed(*peer_id, *state)
            }
            EngineEvent::MessageReceived(message) => {
                self.on_message_received(message.sender, &message.payload, message.timestamp)
            }
            EngineEvent::RadioStateChanged(state) => self.on_radio_state_changed(*state),
        }
    }
}
