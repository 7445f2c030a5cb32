//! Core types for the Nearby discovery engine
//!
//! This module defines the fundamental types shared by the codec, the runtime
//! and the UI-facing delegate, using newtype patterns for validation and type
//! safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::NearbyError;

// ----------------------------------------------------------------------------
// Identity Token
// ----------------------------------------------------------------------------

/// Length of the rotatable identity token carried in advertisements
pub const TOKEN_LEN: usize = 6;

/// Locally generated, rotatable identity token
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityToken([u8; TOKEN_LEN]);

impl IdentityToken {
    /// Create a token from raw bytes
    pub fn new(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random token from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Derive the stable peer identifier for this token
    pub fn peer_id(&self) -> PeerId {
        let mut hasher = Sha256::new();
        hasher.update(b"nearby-peer-id");
        hasher.update(self.0);
        PeerId::from_bytes(&hasher.finalize())
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Opaque stable identifier for a peer (8 bytes derived from its first token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Create a new PeerId from 8 bytes
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create PeerId from the first 8 bytes of a longer identifier
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let len = core::cmp::min(bytes.len(), 8);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = NearbyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean_str)
            .map_err(|_| NearbyError::InvalidInput("invalid hex in peer id".into()))?;

        if bytes.len() != 8 {
            return Err(NearbyError::InvalidInput(format!(
                "peer id must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self::from_bytes(&bytes))
    }
}

impl Deref for PeerId {
    type Target = [u8; 8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Coordinate
// ----------------------------------------------------------------------------

/// Fixed-point scale of coordinate components (1e-7 degrees)
pub const COORDINATE_SCALE: f64 = 10_000_000.0;

/// Last-known location of a peer in fixed-point degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    lat_e7: i32,
    lon_e7: i32,
}

impl Coordinate {
    const MAX_LAT_E7: i32 = 900_000_000;
    const MAX_LON_E7: i32 = 1_800_000_000;

    /// Create a coordinate from fixed-point components, rejecting out of range values
    pub fn from_e7(lat_e7: i32, lon_e7: i32) -> Option<Self> {
        if !(-Self::MAX_LAT_E7..=Self::MAX_LAT_E7).contains(&lat_e7)
            || !(-Self::MAX_LON_E7..=Self::MAX_LON_E7).contains(&lon_e7)
        {
            return None;
        }
        Some(Self { lat_e7, lon_e7 })
    }

    /// Create a coordinate from degrees, rounding to the fixed-point grid
    pub fn from_degrees(latitude: f64, longitude: f64) -> Option<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        let lat = (latitude * COORDINATE_SCALE).round();
        let lon = (longitude * COORDINATE_SCALE).round();
        if lat.abs() > Self::MAX_LAT_E7 as f64 || lon.abs() > Self::MAX_LON_E7 as f64 {
            return None;
        }
        Self::from_e7(lat as i32, lon as i32)
    }

    pub fn lat_e7(&self) -> i32 {
        self.lat_e7
    }

    pub fn lon_e7(&self) -> i32 {
        self.lon_e7
    }

    pub fn latitude(&self) -> f64 {
        self.lat_e7 as f64 / COORDINATE_SCALE
    }

    pub fn longitude(&self) -> f64 {
        self.lon_e7 as f64 / COORDINATE_SCALE
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5},{:.5}", self.latitude(), self.longitude())
    }
}

// ----------------------------------------------------------------------------
// Peer Identity
// ----------------------------------------------------------------------------

/// Maximum display name length in bytes (fits the advertisement payload)
pub const MAX_DISPLAY_NAME_LEN: usize = 8;

/// Identity advertised by a peer: token, display name and optional location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    token: IdentityToken,
    display_name: String,
    coordinate: Option<Coordinate>,
}

impl PeerIdentity {
    /// Create an identity, truncating the display name on a character boundary
    /// and stripping NUL characters so it fits the advertisement payload
    pub fn new(token: IdentityToken, display_name: &str, coordinate: Option<Coordinate>) -> Self {
        let mut name = String::with_capacity(MAX_DISPLAY_NAME_LEN);
        for ch in display_name.chars().filter(|c| *c != '\0') {
            if name.len() + ch.len_utf8() > MAX_DISPLAY_NAME_LEN {
                break;
            }
            name.push(ch);
        }
        Self {
            token,
            display_name: name,
            coordinate,
        }
    }

    pub fn token(&self) -> IdentityToken {
        self.token
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        self.coordinate
    }

    /// Stable peer identifier derived from the token
    pub fn peer_id(&self) -> PeerId {
        self.token.peer_id()
    }

    /// Same display name and location under a new token
    pub fn rotated(&self, token: IdentityToken) -> Self {
        Self {
            token,
            display_name: self.display_name.clone(),
            coordinate: self.coordinate,
        }
    }

    /// Same token and name with an updated location
    pub fn with_coordinate(&self, coordinate: Option<Coordinate>) -> Self {
        Self {
            token: self.token,
            display_name: self.display_name.clone(),
            coordinate,
        }
    }
}

// ----------------------------------------------------------------------------
// Device Handle
// ----------------------------------------------------------------------------

/// Opaque radio-level handle of a remote device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(Arc<str>);

impl DeviceHandle {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Timestamp shifted forward by a duration
    pub fn after(&self, duration: core::time::Duration) -> Self {
        *self + duration.as_millis() as u64
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps for the engine
///
/// Implementations should be monotonic; the registry relies on it when
/// comparing last-seen times against the liveness TTL.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Session lifecycle of a peer record
///
/// `Discovered` is the registry's "visible, no session" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Discovered,
    Connecting,
    Handshaking,
    Active,
    Closed,
}

impl SessionState {
    /// Whether a live session exists in this state
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Handshaking | SessionState::Active
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Discovered => "discovered",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Sightings, Records and Messages
// ----------------------------------------------------------------------------

/// A single decoded advertisement from a peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSighting {
    pub identity: PeerIdentity,
    pub device: DeviceHandle,
    /// Signal strength sample in dBm
    pub rssi: i16,
    pub timestamp: Timestamp,
}

/// Registry entry for a reconciled peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub identity: PeerIdentity,
    pub device: DeviceHandle,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Exponentially smoothed signal strength in dBm
    pub signal: f32,
    pub session_state: SessionState,
}

/// Immutable, shareable view of the registry ordered by signal strength
pub type PeerSnapshot = Arc<[PeerRecord]>;

/// Chat message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: PeerId,
    pub payload: Vec<u8>,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_parse() {
        let peer_id = PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let parsed: PeerId = peer_id.to_string().parse().unwrap();
        assert_eq!(parsed, peer_id);
        assert!("0102".parse::<PeerId>().is_err());
        assert!("zz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_token_peer_id_is_stable() {
        let token = IdentityToken::new([9, 8, 7, 6, 5, 4]);
        assert_eq!(token.peer_id(), token.peer_id());
        assert_ne!(token.peer_id(), IdentityToken::new([9, 8, 7, 6, 5, 3]).peer_id());
    }

    #[test]
    fn test_display_name_truncates_on_char_boundary() {
        let token = IdentityToken::new([1; TOKEN_LEN]);
        let identity = PeerIdentity::new(token, "héllo wörld", None);
        assert_eq!(identity.display_name(), "héllo w");
        assert!(identity.display_name().len() <= MAX_DISPLAY_NAME_LEN);

        let identity = PeerIdentity::new(token, "a\0b", None);
        assert_eq!(identity.display_name(), "ab");
    }

    #[test]
    fn test_coordinate_bounds() {
        let c = Coordinate::from_degrees(47.6062, -122.3321).unwrap();
        assert_eq!(c.lat_e7(), 476_062_000);
        assert_eq!(c.lon_e7(), -1_223_321_000);
        assert!(Coordinate::from_degrees(91.0, 0.0).is_none());
        assert!(Coordinate::from_degrees(0.0, f64::NAN).is_none());
        assert!(Coordinate::from_e7(0, 1_800_000_001).is_none());
    }

    #[test]
    fn test_coordinate_extreme_components() {
        for extreme in [i32::MIN, i32::MAX] {
            assert!(Coordinate::from_e7(extreme, 0).is_none());
            assert!(Coordinate::from_e7(0, extreme).is_none());
        }
        assert!(Coordinate::from_e7(-900_000_000, -1_800_000_000).is_some());
        assert!(Coordinate::from_e7(-900_000_001, 0).is_none());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let a = Timestamp::new(1_000);
        let b = a + 500;
        assert_eq!(b - a, 500);
        assert_eq!(a - b, 0);
        assert_eq!(a.after(core::time::Duration::from_secs(2)), Timestamp::new(3_000));
    }
}
