//! AEAD primitive for file contents
//!
//! Two interchangeable variants:
//! - AES-256-GCM: the default. Every encryption draws a fresh random nonce,
//!   so identical plaintext never produces identical ciphertext.
//! - AES-256-GCM-SIV: used in reverse mode, where the ciphertext view of an
//!   existing plaintext tree must be reproducible. Identical plaintext at
//!   identical positions in identical files yields identical ciphertext.
//!
//! The variant is fixed at mount time.

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::Aes256GcmSiv;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

/// Which AEAD the mount uses for file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadVariant {
    /// AES-256-GCM with random nonces (forward mounts).
    Gcm,
    /// AES-256-GCM-SIV, deterministic under a fixed nonce (reverse mode).
    GcmSiv,
}

enum Inner {
    Gcm(LessSafeKey),
    GcmSiv(Box<Aes256GcmSiv>),
}

/// Content AEAD bound to a key and a variant.
pub struct CryptoCore {
    inner: Inner,
}

impl CryptoCore {
    /// Create a core for the given key and variant.
    pub fn new(key: &[u8; KEY_SIZE], variant: AeadVariant) -> Result<Self> {
        let inner = match variant {
            AeadVariant::Gcm => {
                let unbound = UnboundKey::new(&AES_256_GCM, key)
                    .map_err(|_| Error::KeyDerivation("bad AES-256-GCM key".to_string()))?;
                Inner::Gcm(LessSafeKey::new(unbound))
            }
            AeadVariant::GcmSiv => {
                let cipher = Aes256GcmSiv::new_from_slice(key)
                    .map_err(|_| Error::KeyDerivation("bad AES-256-GCM-SIV key".to_string()))?;
                Inner::GcmSiv(Box::new(cipher))
            }
        };
        Ok(CryptoCore { inner })
    }

    /// Which variant this core was constructed with.
    pub fn variant(&self) -> AeadVariant {
        match self.inner {
            Inner::Gcm(_) => AeadVariant::Gcm,
            Inner::GcmSiv(_) => AeadVariant::GcmSiv,
        }
    }

    /// Encrypt `plaintext` under `nonce` and `aad`. Returns ciphertext with
    /// the 16-byte tag appended.
    pub fn encrypt(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match &self.inner {
            Inner::Gcm(key) => {
                let mut in_out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
                in_out.extend_from_slice(plaintext);
                let n = Nonce::assume_unique_for_key(*nonce);
                key.seal_in_place_append_tag(n, Aad::from(aad), &mut in_out)
                    .map_err(|_| Error::Corrupt("AES-GCM seal failed".to_string()))?;
                Ok(in_out)
            }
            Inner::GcmSiv(cipher) => cipher
                .encrypt(
                    aes_gcm_siv::Nonce::from_slice(nonce),
                    Payload {
                        msg: plaintext,
                        aad,
                    },
                )
                .map_err(|_| Error::Corrupt("AES-GCM-SIV seal failed".to_string())),
        }
    }

    /// Decrypt `ciphertext` (with trailing tag) under `nonce` and `aad`.
    pub fn decrypt(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Corrupt(format!(
                "ciphertext shorter than the tag: {} bytes",
                ciphertext.len()
            )));
        }
        match &self.inner {
            Inner::Gcm(key) => {
                let mut in_out = ciphertext.to_vec();
                let n = Nonce::assume_unique_for_key(*nonce);
                let plaintext = key
                    .open_in_place(n, Aad::from(aad), &mut in_out)
                    .map_err(|_| Error::AuthFailed)?;
                Ok(plaintext.to_vec())
            }
            Inner::GcmSiv(cipher) => cipher
                .decrypt(
                    aes_gcm_siv::Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad,
                    },
                )
                .map_err(|_| Error::AuthFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_array;

    fn roundtrip(variant: AeadVariant) {
        let key = random_array::<KEY_SIZE>();
        let core = CryptoCore::new(&key, variant).unwrap();
        let nonce = random_array::<NONCE_SIZE>();

        let ct = core.encrypt(&nonce, b"ad", b"hello blocks").unwrap();
        assert_eq!(ct.len(), 12 + TAG_SIZE);
        let pt = core.decrypt(&nonce, b"ad", &ct).unwrap();
        assert_eq!(pt, b"hello blocks");
    }

    #[test]
    fn test_gcm_roundtrip() {
        roundtrip(AeadVariant::Gcm);
    }

    #[test]
    fn test_gcm_siv_roundtrip() {
        roundtrip(AeadVariant::GcmSiv);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = random_array::<KEY_SIZE>();
        let core = CryptoCore::new(&key, AeadVariant::Gcm).unwrap();
        let nonce = random_array::<NONCE_SIZE>();

        let ct = core.encrypt(&nonce, b"block 0", b"data").unwrap();
        assert!(core.decrypt(&nonce, b"block 1", &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = random_array::<KEY_SIZE>();
        let core = CryptoCore::new(&key, AeadVariant::Gcm).unwrap();
        let nonce = random_array::<NONCE_SIZE>();

        let mut ct = core.encrypt(&nonce, b"", b"data").unwrap();
        ct[0] ^= 0xff;
        assert!(matches!(
            core.decrypt(&nonce, b"", &ct),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn test_siv_is_deterministic() {
        let key = random_array::<KEY_SIZE>();
        let core = CryptoCore::new(&key, AeadVariant::GcmSiv).unwrap();
        let nonce = [7u8; NONCE_SIZE];

        let a = core.encrypt(&nonce, b"ad", b"same plaintext").unwrap();
        let b = core.encrypt(&nonce, b"ad", b"same plaintext").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_gcm_short_ciphertext_is_corrupt() {
        let key = random_array::<KEY_SIZE>();
        let core = CryptoCore::new(&key, AeadVariant::Gcm).unwrap();
        let nonce = [0u8; NONCE_SIZE];
        assert!(matches!(
            core.decrypt(&nonce, b"", &[1, 2, 3]),
            Err(Error::Corrupt(_))
        ));
    }
}
