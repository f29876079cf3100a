//! Filename encryption
//!
//! Filenames are encrypted deterministically so that lookups can recompute
//! the ciphertext name instead of listing the directory: AES-SIV keyed with
//! the filename subkey, using the containing directory's 16-byte IV as the
//! nonce, then base64-url encoded without padding. Deterministic encryption
//! within one directory is fine (equal names ARE equal), while the
//! per-directory IV makes equal names in different directories encrypt
//! differently.
//!
//! Encoded names longer than NAME_MAX cannot be stored on the backing
//! filesystem; they are replaced by a hash-based stand-in plus a sidecar
//! file holding the full encoded name.

mod diriv;
mod longname;

pub use diriv::{create_diriv_at, read_diriv_at};
pub use longname::{delete_longname_file, hash_long_name, read_longname_file, write_longname_file};

use crate::crypto::NAME_KEY_SIZE;
use crate::error::{Error, Result};
use aes_siv::aead::{Aead, KeyInit};
use aes_siv::{Aes256SivAead, Nonce};
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};

/// Length of the per-directory IV.
pub const DIRIV_LEN: usize = 16;

/// Maximum filename length of the backing filesystem.
pub const NAME_MAX: usize = 255;

/// Config file in the cipher directory root.
pub const CONF_NAME: &str = "gocryptfs.conf";

/// Per-directory IV sidecar filename.
pub const DIRIV_NAME: &str = "gocryptfs.diriv";

/// Prefix of long-name stand-ins and their sidecars.
pub const LONGNAME_PREFIX: &str = "gocryptfs.longname.";

/// Suffix of the sidecar holding a full encoded long name.
pub const LONGNAME_SUFFIX: &str = ".name";

/// True for backing-store names that must never appear in the plaintext
/// view.
pub fn is_reserved_name(name: &str) -> bool {
    name == CONF_NAME || name == DIRIV_NAME || name.starts_with(LONGNAME_PREFIX)
}

/// Result of encrypting a name for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashedName {
    /// The encoded name fits in NAME_MAX and is stored as-is.
    Short(String),
    /// The encoded name is too long; `stored` is the on-disk stand-in and
    /// `cipher_name` the full encoded name the caller must persist in the
    /// sidecar.
    Long { stored: String, cipher_name: String },
}

impl HashedName {
    /// The name that actually appears in the backing directory.
    pub fn stored(&self) -> &str {
        match self {
            HashedName::Short(s) => s,
            HashedName::Long { stored, .. } => stored,
        }
    }
}

/// Deterministic filename encryption bound to the filename subkey.
pub struct NameTransform {
    cipher: Aes256SivAead,
}

impl NameTransform {
    pub fn new(name_key: &[u8; NAME_KEY_SIZE]) -> Result<Self> {
        let cipher = Aes256SivAead::new_from_slice(name_key)
            .map_err(|_| Error::KeyDerivation("bad filename key".to_string()))?;
        Ok(NameTransform { cipher })
    }

    /// Encrypt a plaintext filename under the directory IV.
    pub fn encrypt_name(&self, name: &str, iv: &[u8; DIRIV_LEN]) -> Result<String> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::BadName);
        }
        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(iv), name.as_bytes())
            .map_err(|_| Error::BadName)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(ct))
    }

    /// Decrypt a base64 ciphertext name under the directory IV.
    pub fn decrypt_name(&self, cipher_name: &str, iv: &[u8; DIRIV_LEN]) -> Result<String> {
        let ct = BASE64_URL_SAFE_NO_PAD
            .decode(cipher_name)
            .map_err(|_| Error::BadName)?;
        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(iv), ct.as_slice())
            .map_err(|_| Error::BadName)?;
        let name = String::from_utf8(pt).map_err(|_| Error::BadName)?;
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\0')
        {
            return Err(Error::BadName);
        }
        Ok(name)
    }

    /// Encrypt a name and, if the encoded form exceeds NAME_MAX, replace it
    /// with the long-name stand-in. Writing or reading the `.name` sidecar
    /// is up to the caller.
    pub fn encrypt_and_hash(&self, name: &str, iv: &[u8; DIRIV_LEN]) -> Result<HashedName> {
        let cipher_name = self.encrypt_name(name, iv)?;
        if cipher_name.len() > NAME_MAX {
            let stored = hash_long_name(&cipher_name);
            return Ok(HashedName::Long {
                stored,
                cipher_name,
            });
        }
        Ok(HashedName::Short(cipher_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_array;

    fn test_transform() -> NameTransform {
        NameTransform::new(&random_array()).unwrap()
    }

    #[test]
    fn test_name_roundtrip() {
        let nt = test_transform();
        let iv = random_array::<DIRIV_LEN>();
        for name in ["a", "hello.txt", "snowman ☃", &"x".repeat(100)] {
            let c = nt.encrypt_name(name, &iv).unwrap();
            assert_ne!(c, name);
            assert_eq!(nt.decrypt_name(&c, &iv).unwrap(), name);
        }
    }

    #[test]
    fn test_encryption_is_deterministic_per_directory() {
        let nt = test_transform();
        let iv1 = [1u8; DIRIV_LEN];
        let iv2 = [2u8; DIRIV_LEN];
        assert_eq!(
            nt.encrypt_name("file", &iv1).unwrap(),
            nt.encrypt_name("file", &iv1).unwrap()
        );
        assert_ne!(
            nt.encrypt_name("file", &iv1).unwrap(),
            nt.encrypt_name("file", &iv2).unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_plain_names() {
        let nt = test_transform();
        let iv = [0x11u8; DIRIV_LEN];
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(nt.encrypt_name(name, &iv), Err(Error::BadName)));
        }
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let nt = test_transform();
        let iv = [0x11u8; DIRIV_LEN];
        // Not base64
        assert!(nt.decrypt_name("@@@", &iv).is_err());
        // Valid base64 but not a valid ciphertext
        assert!(nt.decrypt_name("aGVsbG8", &iv).is_err());
        // Wrong IV
        let c = nt.encrypt_name("file", &iv).unwrap();
        assert!(nt.decrypt_name(&c, &[0x22u8; DIRIV_LEN]).is_err());
    }

    #[test]
    fn test_long_name_stand_in() {
        let nt = test_transform();
        let iv = random_array::<DIRIV_LEN>();
        let long = "y".repeat(250);

        match nt.encrypt_and_hash(&long, &iv).unwrap() {
            HashedName::Long {
                stored,
                cipher_name,
            } => {
                assert!(stored.starts_with(LONGNAME_PREFIX));
                assert!(stored.len() <= NAME_MAX);
                assert_eq!(hash_long_name(&cipher_name), stored);
                // The full encoded name round-trips back to the input.
                assert_eq!(nt.decrypt_name(&cipher_name, &iv).unwrap(), long);
            }
            other => panic!("expected a long name, got {:?}", other),
        }

        match nt.encrypt_and_hash("short", &iv).unwrap() {
            HashedName::Short(s) => assert!(s.len() <= NAME_MAX),
            other => panic!("expected a short name, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("gocryptfs.conf"));
        assert!(is_reserved_name("gocryptfs.diriv"));
        assert!(is_reserved_name("gocryptfs.longname.abc"));
        assert!(is_reserved_name("gocryptfs.longname.abc.name"));
        assert!(!is_reserved_name("regular.txt"));
        assert!(!is_reserved_name("gocryptfs"));
    }
}
