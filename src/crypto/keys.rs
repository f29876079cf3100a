//! Key schedule for cloakfs
//!
//! The 32-byte master key lives for one mount and is zeroized on drop. It
//! is never used directly: HKDF-SHA256 expands it into the content key
//! (file blocks) and the filename key (directory-IV name encryption).

use crate::crypto::{KEY_SIZE, NAME_KEY_SIZE};
use crate::error::{Error, Result};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use zeroize::Zeroizing;

const CONTENT_KEY_INFO: &[u8] = b"cloakfs-content-key-v2";
const NAME_KEY_INFO: &[u8] = b"cloakfs-name-key-v2";

/// Master key of one mount.
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Generate a fresh random master key (volume initialization).
    pub fn random() -> Self {
        MasterKey {
            key: Zeroizing::new(crate::crypto::random_array()),
        }
    }

    /// Wrap existing key material, e.g. unwrapped from the config file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::KeyDerivation(format!(
                "master key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(MasterKey {
            key: Zeroizing::new(key),
        })
    }

    /// Raw key bytes, for wrapping into the config file.
    pub fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Subkey for file-content encryption.
    pub fn content_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        self.derive(CONTENT_KEY_INFO, out.as_mut())?;
        Ok(out)
    }

    /// Subkey for filename encryption (double width, AES-SIV).
    pub fn name_key(&self) -> Result<Zeroizing<[u8; NAME_KEY_SIZE]>> {
        let mut out = Zeroizing::new([0u8; NAME_KEY_SIZE]);
        self.derive(NAME_KEY_INFO, out.as_mut())?;
        Ok(out)
    }

    fn derive(&self, info: &'static [u8], out: &mut [u8]) -> Result<()> {
        let salt = Salt::new(HKDF_SHA256, b"");
        let prk = salt.extract(self.key.as_ref());
        prk.expand(&[info], HkdfLen(out.len()))
            .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
            .fill(out)
            .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;
        Ok(())
    }
}

/// Output-length marker for ring's HKDF API.
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}
