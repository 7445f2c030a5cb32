//! Advertisement payload codec
//!
//! The payload is a fixed 24-byte frame sized for the service-data budget of a
//! legacy (31-byte) BLE advertisement:
//!
//! ```text
//! 0      1      2            8          12         16              24
//! +------+------+------------+----------+----------+---------------+
//! | ver  | flags| token (6)  | lat (i32)| lon (i32)| name (8, pad) |
//! +------+------+------------+----------+----------+---------------+
//! ```
//!
//! All integers are big-endian; coordinates are in 1e-7 degrees.

use crate::errors::DecodeError;
use crate::types::{Coordinate, IdentityToken, PeerIdentity, MAX_DISPLAY_NAME_LEN, TOKEN_LEN};

// ----------------------------------------------------------------------------
// Layout
// ----------------------------------------------------------------------------

/// Current payload version
pub const ADVERTISEMENT_VERSION: u8 = 1;

/// Total payload size in bytes
pub const ADVERTISEMENT_LEN: usize = 24;

/// Flag set when the coordinate fields carry a location
pub const FLAG_HAS_COORDINATE: u8 = 0b0000_0001;

const FLAGS_OFFSET: usize = 1;
const TOKEN_OFFSET: usize = 2;
const LAT_OFFSET: usize = TOKEN_OFFSET + TOKEN_LEN;
const LON_OFFSET: usize = LAT_OFFSET + 4;
const NAME_OFFSET: usize = LON_OFFSET + 4;

/// Encoded advertisement payload
pub type AdvertisementPayload = [u8; ADVERTISEMENT_LEN];

// ----------------------------------------------------------------------------
// Encode / Decode
// ----------------------------------------------------------------------------

/// Encode an identity into the fixed-size advertisement payload
pub fn encode(identity: &PeerIdentity) -> AdvertisementPayload {
    let mut out = [0u8; ADVERTISEMENT_LEN];
    out[0] = ADVERTISEMENT_VERSION;
    out[TOKEN_OFFSET..LAT_OFFSET].copy_from_slice(identity.token().as_bytes());

    if let Some(coordinate) = identity.coordinate() {
        out[FLAGS_OFFSET] |= FLAG_HAS_COORDINATE;
        out[LAT_OFFSET..LON_OFFSET].copy_from_slice(&coordinate.lat_e7().to_be_bytes());
        out[LON_OFFSET..NAME_OFFSET].copy_from_slice(&coordinate.lon_e7().to_be_bytes());
    }

    // PeerIdentity guarantees the name fits and contains no NUL
    let name = identity.display_name().as_bytes();
    out[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
    out
}

/// Decode an advertisement payload back into a peer identity
pub fn decode(bytes: &[u8]) -> Result<PeerIdentity, DecodeError> {
    let version = *bytes
        .first()
        .ok_or(DecodeError::malformed("empty payload"))?;
    if version != ADVERTISEMENT_VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }
    if bytes.len() < ADVERTISEMENT_LEN {
        return Err(DecodeError::malformed("truncated payload"));
    }
    if bytes.len() > ADVERTISEMENT_LEN {
        return Err(DecodeError::malformed("trailing bytes"));
    }

    let flags = bytes[FLAGS_OFFSET];
    if flags & !FLAG_HAS_COORDINATE != 0 {
        return Err(DecodeError::malformed("unknown flag bits"));
    }

    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&bytes[TOKEN_OFFSET..LAT_OFFSET]);

    let lat_e7 = read_i32(&bytes[LAT_OFFSET..LON_OFFSET]);
    let lon_e7 = read_i32(&bytes[LON_OFFSET..NAME_OFFSET]);
    let coordinate = if flags & FLAG_HAS_COORDINATE != 0 {
        Some(
            Coordinate::from_e7(lat_e7, lon_e7)
                .ok_or(DecodeError::malformed("coordinate out of range"))?,
        )
    } else {
        if lat_e7 != 0 || lon_e7 != 0 {
            return Err(DecodeError::malformed("coordinate without flag"));
        }
        None
    };

    let name_field = &bytes[NAME_OFFSET..NAME_OFFSET + MAX_DISPLAY_NAME_LEN];
    let name_len = name_field
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(MAX_DISPLAY_NAME_LEN);
    if name_field[name_len..].iter().any(|b| *b != 0) {
        return Err(DecodeError::malformed("non-zero name padding"));
    }
    let name = core::str::from_utf8(&name_field[..name_len])
        .map_err(|_| DecodeError::malformed("display name is not UTF-8"))?;

    Ok(PeerIdentity::new(
        IdentityToken::new(token),
        name,
        coordinate,
    ))
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    i32::from_be_bytes(buf)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(coordinate: Option<Coordinate>) -> PeerIdentity {
        PeerIdentity::new(IdentityToken::new([1, 2, 3, 4, 5, 6]), "alice", coordinate)
    }

    #[test]
    fn test_encode_layout() {
        let coordinate = Coordinate::from_e7(1, -1);
        let payload = encode(&identity(coordinate));

        assert_eq!(payload[0], ADVERTISEMENT_VERSION);
        assert_eq!(payload[1], FLAG_HAS_COORDINATE);
        assert_eq!(&payload[2..8], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&payload[8..12], &[0, 0, 0, 1]);
        assert_eq!(&payload[12..16], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&payload[16..24], b"alice\0\0\0");
    }

    #[test]
    fn test_round_trip_with_and_without_coordinate() {
        for coordinate in [None, Coordinate::from_degrees(-33.8688, 151.2093)] {
            let original = identity(coordinate);
            assert_eq!(decode(&encode(&original)).unwrap(), original);
        }
    }

    #[test]
    fn test_full_length_name() {
        let original = PeerIdentity::new(IdentityToken::new([7; 6]), "12345678", None);
        assert_eq!(decode(&encode(&original)).unwrap(), original);
    }

    #[test]
    fn test_rejects_truncated_and_empty() {
        let payload = encode(&identity(None));
        assert_eq!(
            decode(&payload[..10]),
            Err(DecodeError::Malformed { reason: "truncated payload" })
        );
        assert!(matches!(decode(&[]), Err(DecodeError::Malformed { .. })));

        let mut long = payload.to_vec();
        long.push(0);
        assert!(matches!(decode(&long), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_rejects_version_mismatch() {
        let mut payload = encode(&identity(None));
        payload[0] = 2;
        assert_eq!(
            decode(&payload),
            Err(DecodeError::UnsupportedVersion { version: 2 })
        );
        // A future version with a different length still reports the version
        assert_eq!(
            decode(&[9, 0, 0]),
            Err(DecodeError::UnsupportedVersion { version: 9 })
        );
    }

    #[test]
    fn test_rejects_malformed_fields() {
        let base = encode(&identity(None));

        let mut bad_flags = base;
        bad_flags[1] = 0b1000_0000;
        assert!(matches!(decode(&bad_flags), Err(DecodeError::Malformed { .. })));

        let mut stray_coordinate = base;
        stray_coordinate[11] = 1;
        assert!(matches!(decode(&stray_coordinate), Err(DecodeError::Malformed { .. })));

        let mut out_of_range = base;
        out_of_range[1] = FLAG_HAS_COORDINATE;
        out_of_range[8..12].copy_from_slice(&i32::MAX.to_be_bytes());
        assert!(matches!(decode(&out_of_range), Err(DecodeError::Malformed { .. })));

        for extreme in [i32::MIN, i32::MAX] {
            let mut extreme_lat = base;
            extreme_lat[1] = FLAG_HAS_COORDINATE;
            extreme_lat[8..12].copy_from_slice(&extreme.to_be_bytes());
            assert!(matches!(decode(&extreme_lat), Err(DecodeError::Malformed { .. })));

            let mut extreme_lon = base;
            extreme_lon[1] = FLAG_HAS_COORDINATE;
            extreme_lon[12..16].copy_from_slice(&extreme.to_be_bytes());
            assert!(matches!(decode(&extreme_lon), Err(DecodeError::Malformed { .. })));
        }

        let mut bad_utf8 = base;
        bad_utf8[16] = 0xFF;
        assert!(matches!(decode(&bad_utf8), Err(DecodeError::Malformed { .. })));

        let mut bad_padding = base;
        bad_padding[23] = b'x';
        assert!(matches!(decode(&bad_padding), Err(DecodeError::Malformed { .. })));
    }
}
