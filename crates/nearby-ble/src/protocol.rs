//! BLE protocol constants and frame chunking
//!
//! Session frames are larger than one ATT write, so every frame is prefixed
//! with its length (`u16`, big-endian) and split into chunks:
//!
//! ```text
//! write (central -> peripheral):          | len (2) | frame bytes ... |
//! notify (peripheral -> central): | dest token (6) | len (2) | frame ... |
//! ```
//!
//! Notifications go to every subscribed central, so each one carries the
//! destination token and centrals drop chunks addressed to someone else.

use nearby_core::types::TOKEN_LEN;
use nearby_core::IdentityToken;
use uuid::Uuid;

use crate::error::BleError;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Short (16-bit) alias of the Nearby service, so that the flags, the service
/// data header and the 24-byte payload fit a legacy 31-byte advertisement
pub const NEARBY_SERVICE_SHORT_UUID: u16 = 0xFF4E;

/// Nearby BLE service UUID; advertisements carry the identity payload as
/// service data for this UUID
pub const NEARBY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FF4E_0000_1000_8000_00805F9B34FB);

/// Characteristic centrals write frames to
pub const NEARBY_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4E450002_5242_4C45_9A3C_5A4E45415259);

/// Characteristic the peripheral notifies frames on
pub const NEARBY_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4E450003_5242_4C45_9A3C_5A4E45415259);

/// Bytes of the length prefix in front of each frame
pub const LENGTH_PREFIX_LEN: usize = 2;

// ----------------------------------------------------------------------------
// Chunking
// ----------------------------------------------------------------------------

/// Prefix `frame` with its length and split it into chunks of `chunk_size`
pub fn chunk_frame(frame: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>, BleError> {
    if frame.len() > u16::MAX as usize {
        return Err(BleError::FrameTooLarge {
            size: frame.len(),
            max_size: u16::MAX as usize,
        });
    }
    if chunk_size == 0 {
        return Err(BleError::MalformedChunk("chunk size must be positive".into()));
    }

    let mut stream = Vec::with_capacity(LENGTH_PREFIX_LEN + frame.len());
    stream.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    stream.extend_from_slice(frame);
    Ok(stream.chunks(chunk_size).map(<[u8]>::to_vec).collect())
}

/// Prepend the destination token to a notification chunk
pub fn address_chunk(destination: &IdentityToken, chunk: &[u8]) -> Vec<u8> {
    let mut addressed = Vec::with_capacity(TOKEN_LEN + chunk.len());
    addressed.extend_from_slice(destination.as_bytes());
    addressed.extend_from_slice(chunk);
    addressed
}

/// Split a notification into its destination token and chunk
pub fn split_addressed(data: &[u8]) -> Option<(IdentityToken, &[u8])> {
    if data.len() <= TOKEN_LEN {
        return None;
    }
    let (token, chunk) = data.split_at(TOKEN_LEN);
    let mut bytes = [0u8; TOKEN_LEN];
    bytes.copy_from_slice(token);
    Some((IdentityToken::new(bytes), chunk))
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

/// Reassembles length-prefixed frames from a stream of chunks
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Feed one chunk; returns every frame it completed
    ///
    /// An oversized length prefix discards the buffered stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, BleError> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buffer.len() >= LENGTH_PREFIX_LEN {
            let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if len > self.max_frame_size {
                self.buffer.clear();
                return Err(BleError::FrameTooLarge {
                    size: len,
                    max_size: self.max_frame_size,
                });
            }
            if self.buffer.len() < LENGTH_PREFIX_LEN + len {
                break;
            }
            let rest = self.buffer.split_off(LENGTH_PREFIX_LEN + len);
            let frame = std::mem::replace(&mut self.buffer, rest);
            frames.push(frame[LENGTH_PREFIX_LEN..].to_vec());
        }
        Ok(frames)
    }

    /// Bytes of an incomplete frame currently buffered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
