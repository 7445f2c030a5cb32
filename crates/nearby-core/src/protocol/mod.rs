//! Wire formats: the advertisement payload and session frames

pub mod advertisement;
pub mod frame;

pub use advertisement::{
    decode, encode, AdvertisementPayload, ADVERTISEMENT_LEN, ADVERTISEMENT_VERSION,
};
pub use frame::{echo_digest, generate_nonce, verify_echo, Frame, Nonce, HANDSHAKE_VERSION};
