//! Peer registry
//!
//! The registry is the single source of truth for which peers are currently
//! visible. It is owned by the engine worker task, which serializes every
//! `observe` and `sweep`; there is no internal locking.

use std::collections::HashMap;

use nearby_core::{
    IdentityToken, PeerId, PeerRecord, PeerSighting, PeerSnapshot, RegistryConfig, SessionState,
    Timestamp,
};
use tracing::{debug, trace};

/// Smoothing factor of the signal strength moving average
pub const SIGNAL_SMOOTHING: f32 = 0.3;

// ----------------------------------------------------------------------------
// Observation Results
// ----------------------------------------------------------------------------

/// What an `observe` call did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A new record was created
    Discovered(PeerId),
    /// An existing record was refreshed
    Updated(PeerId),
    /// A rotated token was linked to an existing record
    Linked(PeerId),
}

impl Observation {
    pub fn peer_id(&self) -> PeerId {
        match self {
            Observation::Discovered(id) | Observation::Updated(id) | Observation::Linked(id) => *id,
        }
    }
}

/// Pending change waiting to be turned into an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Discovered(PeerId),
    Updated(PeerId),
}

impl RegistryChange {
    pub fn peer_id(&self) -> PeerId {
        match self {
            RegistryChange::Discovered(id) | RegistryChange::Updated(id) => *id,
        }
    }
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sightings: u64,
    pub discovered: u64,
    pub linked: u64,
    pub evicted: u64,
}

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// Time-bounded set of visible peers
#[derive(Debug)]
pub struct PeerRegistry {
    config: RegistryConfig,
    records: HashMap<PeerId, PeerRecord>,
    /// Every token we have seen for a live record
    aliases: HashMap<IdentityToken, PeerId>,
    pending: Vec<RegistryChange>,
    stats: RegistryStats,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            aliases: HashMap::new(),
            pending: Vec::new(),
            stats: RegistryStats::default(),
        }
    }

    /// Insert or refresh the record for a sighting
    pub fn observe(&mut self, sighting: PeerSighting) -> Observation {
        self.stats.sightings += 1;
        let token = sighting.identity.token();

        if let Some(peer_id) = self.aliases.get(&token).copied() {
            if let Some(record) = self.records.get_mut(&peer_id) {
                refresh(record, &sighting);
                trace!("Refreshed peer {} (signal {:.1})", peer_id, record.signal);
                self.queue(RegistryChange::Updated(peer_id));
                return Observation::Updated(peer_id);
            }
        }

        if let Some(peer_id) = self.find_rotation_link(&sighting) {
            if let Some(record) = self.records.get_mut(&peer_id) {
                debug!(
                    "Linked rotated token {} to peer {} ({})",
                    token,
                    peer_id,
                    record.identity.display_name()
                );
                record.identity = sighting.identity.clone();
                refresh(record, &sighting);
                self.aliases.insert(token, peer_id);
                self.stats.linked += 1;
                self.queue(RegistryChange::Updated(peer_id));
                return Observation::Linked(peer_id);
            }
        }

        let peer_id = sighting.identity.peer_id();
        debug!(
            "Discovered peer {} ({}) at {} dBm",
            peer_id,
            sighting.identity.display_name(),
            sighting.rssi
        );
        self.records.insert(
            peer_id,
            PeerRecord {
                peer_id,
                identity: sighting.identity,
                device: sighting.device,
                first_seen: sighting.timestamp,
                last_seen: sighting.timestamp,
                signal: sighting.rssi as f32,
                session_state: SessionState::Discovered,
            },
        );
        self.aliases.insert(token, peer_id);
        self.stats.discovered += 1;
        self.queue(RegistryChange::Discovered(peer_id));
        Observation::Discovered(peer_id)
    }

    /// Evict every record whose age exceeds the TTL, returning each exactly once
    pub fn sweep(&mut self, now: Timestamp) -> Vec<PeerRecord> {
        let ttl = self.config.peer_ttl_ms;
        let expired: Vec<PeerId> = self
            .records
            .values()
            .filter(|record| now - record.last_seen > ttl)
            .map(|record| record.peer_id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for peer_id in expired {
            if let Some(record) = self.records.remove(&peer_id) {
                debug!(
                    "Evicting peer {} (last seen {}ms ago)",
                    peer_id,
                    now - record.last_seen
                );
                evicted.push(record);
            }
        }

        if !evicted.is_empty() {
            let records = &self.records;
            self.aliases.retain(|_, peer_id| records.contains_key(peer_id));
            self.pending.retain(|change| records.contains_key(&change.peer_id()));
            self.stats.evicted += evicted.len() as u64;
        }
        evicted.sort_by_key(|record| record.peer_id);
        evicted
    }

    /// Immutable view ordered by smoothed signal strength, strongest first
    pub fn snapshot(&self) -> PeerSnapshot {
        let mut records: Vec<PeerRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.signal
                .total_cmp(&a.signal)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        records.into()
    }

    /// Drain pending changes in first-occurrence order
    pub fn take_changes(&mut self) -> Vec<RegistryChange> {
        std::mem::take(&mut self.pending)
    }

    /// Update the session state of a record. Returns false for unknown peers.
    pub fn set_session_state(&mut self, peer_id: PeerId, state: SessionState) -> bool {
        match self.records.get_mut(&peer_id) {
            Some(record) => {
                record.session_state = state;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    /// Resolve any token seen for a live record to its peer id
    pub fn resolve(&self, token: &IdentityToken) -> Option<PeerId> {
        self.aliases.get(token).copied()
    }

    /// Records in arbitrary order
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    fn queue(&mut self, change: RegistryChange) {
        let peer_id = change.peer_id();
        if !self.pending.iter().any(|c| c.peer_id() == peer_id) {
            self.pending.push(change);
        }
    }

    /// A rotated token links to the only record with the same display name
    /// that was seen within the link window at a similar signal strength.
    fn find_rotation_link(&self, sighting: &PeerSighting) -> Option<PeerId> {
        if !self.config.link_rotations {
            return None;
        }
        let name = sighting.identity.display_name();
        if name.is_empty() {
            return None;
        }

        let mut candidates = self.records.values().filter(|record| {
            record.identity.display_name() == name
                && record.identity.token() != sighting.identity.token()
                && sighting.timestamp - record.last_seen <= self.config.link_window_ms
                && (record.signal - sighting.rssi as f32).abs() <= self.config.link_rssi_tolerance
        });

        match (candidates.next(), candidates.next()) {
            (Some(record), None) => Some(record.peer_id),
            _ => None,
        }
    }
}

fn refresh(record: &mut PeerRecord, sighting: &PeerSighting) {
    record.last_seen = record.last_seen.max(sighting.timestamp);
    record.signal = SIGNAL_SMOOTHING * sighting.rssi as f32 + (1.0 - SIGNAL_SMOOTHING) * record.signal;
    record.device = sighting.device.clone();
    if record.session_state == SessionState::Closed {
        record.session_state = SessionState::Discovered;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
