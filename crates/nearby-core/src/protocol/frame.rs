//! Session wire frames and the nonce/echo handshake
//!
//! Frames are serialized with bincode. The initiator opens with `Hello`
//! carrying a fresh nonce; the responder answers `Echo` with a digest over the
//! nonce and its advertised token.
//!
//! The handshake confirms that both ends speak the protocol and agree on the
//! tokens. It is not authentication: tokens are broadcast in the clear, so any
//! device that replays another peer's advertisement can compute the echo, and
//! nothing binds a `Hello` token to the device that sent it.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{NearbyError, NearbyResult, TransportError};
use crate::types::{IdentityToken, Timestamp};

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

/// Handshake protocol version carried in `Hello`
pub const HANDSHAKE_VERSION: u8 = 1;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 16;

/// Random handshake challenge
pub type Nonce = [u8; NONCE_LEN];

/// Generate a fresh handshake nonce
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Digest the responder must return for `nonce` under `token`
///
/// Computable by anyone who has seen `token` advertised.
pub fn echo_digest(nonce: &Nonce, token: &IdentityToken) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"nearby-handshake-echo");
    hasher.update(nonce);
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Application-level frames exchanged over a session transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Initiator challenge, identifying the initiator by its current token
    Hello {
        version: u8,
        nonce: Nonce,
        token: IdentityToken,
    },
    /// Responder proof of token ownership
    Echo {
        token: IdentityToken,
        digest: [u8; 32],
    },
    /// Chat message
    Message {
        timestamp: Timestamp,
        payload: Vec<u8>,
    },
    /// Orderly close
    Goodbye,
}

impl Frame {
    /// Build the echo answering `nonce` for `token`
    pub fn echo_for(nonce: &Nonce, token: IdentityToken) -> Self {
        Frame::Echo {
            token,
            digest: echo_digest(nonce, &token),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> NearbyResult<Vec<u8>> {
        bincode::serialize(self).map_err(NearbyError::Serialization)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(data).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Echo { .. } => "echo",
            Frame::Message { .. } => "message",
            Frame::Goodbye => "goodbye",
        }
    }
}

/// Check an echo against the nonce we sent and the token we expect
pub fn verify_echo(frame: &Frame, nonce: &Nonce, expected: &IdentityToken) -> bool {
    match frame {
        Frame::Echo { token, digest } => {
            token == expected && *digest == echo_digest(nonce, expected)
        }
        _ => false,
    }
}
