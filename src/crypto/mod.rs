//! Cryptography module for cloakfs
//!
//! Provides the symmetric AEAD primitive used for file contents
//! (AES-256-GCM, or AES-256-GCM-SIV in reverse mode), random byte
//! generation, and the HKDF key schedule that turns the 32-byte master key
//! into the content and filename subkeys.

mod aead;
mod keys;

pub use aead::{AeadVariant, CryptoCore};
pub use keys::MasterKey;

use rand::RngCore;

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a GCM / GCM-SIV nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of the filename-encryption key in bytes. AES-SIV consumes a
/// double-width key.
pub const NAME_KEY_SIZE: usize = 64;

/// Fill a fresh vector with `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Generate a random fixed-size array.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
