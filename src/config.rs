//! Config file handling
//!
//! `gocryptfs.conf` in the cipher directory root stores everything needed
//! to unlock a volume: the master key wrapped under a password-derived key,
//! the scrypt parameters of that derivation, the on-disk format version and
//! the feature flags. The file itself is opaque to the I/O core; this
//! module is the collaborator that turns a password into a
//! [`MasterKey`](crate::crypto::MasterKey).

use crate::crypto::{AeadVariant, CryptoCore, MasterKey, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::names::CONF_NAME;
use base64::{prelude::BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

/// On-disk config format version.
pub const CONF_VERSION: u16 = 2;

/// Feature flag: filenames are encrypted under per-directory IVs.
pub const FLAG_DIRIV: &str = "DirIV";
/// Feature flag: over-long names get hashed stand-ins.
pub const FLAG_LONGNAMES: &str = "LongNames";
/// Feature flag: deterministic content encryption (reverse mode).
pub const FLAG_AESSIV: &str = "AESSIV";

const KNOWN_FLAGS: &[&str] = &[FLAG_DIRIV, FLAG_LONGNAMES, FLAG_AESSIV];

/// Default scrypt cost: N = 2^16.
const DEFAULT_LOG_N: u8 = 16;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SALT_LEN: usize = 32;

/// scrypt parameters as stored in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScryptKdf {
    /// Random salt, base64.
    pub salt: String,
    pub n: u64,
    pub r: u32,
    pub p: u32,
    pub key_len: u32,
}

impl ScryptKdf {
    fn new(log_n: u8) -> Self {
        ScryptKdf {
            salt: BASE64_STANDARD.encode(crate::crypto::random_bytes(SALT_LEN)),
            n: 1u64 << log_n,
            r: SCRYPT_R,
            p: SCRYPT_P,
            key_len: KEY_SIZE as u32,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.n.is_power_of_two() || self.n < (1 << 10) || self.n > (1 << 28) {
            return Err(Error::Config(format!("bad scrypt N: {}", self.n)));
        }
        if self.r == 0 || self.p == 0 {
            return Err(Error::Config("bad scrypt r/p".to_string()));
        }
        if self.key_len as usize != KEY_SIZE {
            return Err(Error::Config(format!("bad scrypt KeyLen: {}", self.key_len)));
        }
        Ok(())
    }

    /// Derive the key-encryption key from a password.
    fn derive(&self, password: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        self.validate()?;
        let salt = BASE64_STANDARD
            .decode(&self.salt)
            .map_err(|_| Error::Config("bad scrypt salt".to_string()))?;
        let log_n = self.n.trailing_zeros() as u8;
        let params = scrypt::Params::new(log_n, self.r, self.p, KEY_SIZE)
            .map_err(|e| Error::KeyDerivation(format!("bad scrypt parameters: {}", e)))?;
        let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
        scrypt::scrypt(password, &salt, &params, kek.as_mut())
            .map_err(|e| Error::KeyDerivation(format!("scrypt failed: {}", e)))?;
        Ok(kek)
    }
}

/// Parsed `gocryptfs.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CryptConf {
    /// Human-readable creator string, e.g. "cloakfs 0.1.0".
    pub creator: String,
    /// Wrapped master key: nonce || ciphertext || tag, base64.
    pub encrypted_key: String,
    pub scrypt_object: ScryptKdf,
    pub version: u16,
    pub feature_flags: Vec<String>,
}

impl CryptConf {
    /// Create a config wrapping a fresh random master key.
    pub fn create(password: &[u8], aessiv: bool) -> Result<(CryptConf, MasterKey)> {
        Self::create_with_log_n(password, aessiv, DEFAULT_LOG_N)
    }

    /// Like [`create`](Self::create) with an explicit scrypt cost. Tests
    /// use a cheap cost; everything else wants the default.
    pub fn create_with_log_n(
        password: &[u8],
        aessiv: bool,
        log_n: u8,
    ) -> Result<(CryptConf, MasterKey)> {
        if password.is_empty() {
            return Err(Error::PasswordEmpty);
        }
        let master = MasterKey::random();
        let kdf = ScryptKdf::new(log_n);
        let mut flags = vec![FLAG_DIRIV.to_string(), FLAG_LONGNAMES.to_string()];
        if aessiv {
            flags.push(FLAG_AESSIV.to_string());
        }
        let conf = CryptConf {
            creator: format!("cloakfs {}", env!("CARGO_PKG_VERSION")),
            encrypted_key: wrap_key(&kdf, password, &master)?,
            scrypt_object: kdf,
            version: CONF_VERSION,
            feature_flags: flags,
        };
        Ok((conf, master))
    }

    /// Load and validate the config from `path`.
    pub fn load(path: &Path) -> Result<CryptConf> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let conf: CryptConf = serde_json::from_str(&raw)?;
        if conf.version != CONF_VERSION {
            return Err(Error::Config(format!(
                "unsupported config version {}",
                conf.version
            )));
        }
        conf.scrypt_object.validate()?;
        for flag in &conf.feature_flags {
            if !KNOWN_FLAGS.contains(&flag.as_str()) {
                return Err(Error::Config(format!(
                    "unknown feature flag {:?} (created by a newer version?)",
                    flag
                )));
            }
        }
        Ok(conf)
    }

    /// Write the config to `path`: temp file plus rename, so a crash cannot
    /// leave a half-written config behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Decrypt the master key with the given password.
    pub fn unwrap_key(&self, password: &[u8]) -> Result<MasterKey> {
        if password.is_empty() {
            return Err(Error::PasswordEmpty);
        }
        let kek = self.scrypt_object.derive(password)?;
        let blob = BASE64_STANDARD
            .decode(&self.encrypted_key)
            .map_err(|_| Error::Config("bad encrypted key".to_string()))?;
        if blob.len() != NONCE_SIZE + KEY_SIZE + crate::crypto::TAG_SIZE {
            return Err(Error::Config(format!(
                "encrypted key has {} bytes",
                blob.len()
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&blob[..NONCE_SIZE]);
        let core = CryptoCore::new(&kek, AeadVariant::Gcm)?;
        let key = Zeroizing::new(core.decrypt(&nonce, &[], &blob[NONCE_SIZE..]).map_err(
            |e| match e {
                Error::AuthFailed => Error::WrongPassword,
                other => other,
            },
        )?);
        MasterKey::from_bytes(&key)
    }

    /// Re-wrap the master key under a new password.
    pub fn rewrap(&mut self, old_password: &[u8], new_password: &[u8]) -> Result<()> {
        if new_password.is_empty() {
            return Err(Error::PasswordEmpty);
        }
        let master = self.unwrap_key(old_password)?;
        // Fresh salt with the new password.
        let log_n = self.scrypt_object.n.trailing_zeros() as u8;
        let kdf = ScryptKdf::new(log_n);
        self.encrypted_key = wrap_key(&kdf, new_password, &master)?;
        self.scrypt_object = kdf;
        info!("master key re-wrapped under new password");
        Ok(())
    }

    /// Does this volume use deterministic (reverse-mode) content
    /// encryption?
    pub fn is_aessiv(&self) -> bool {
        self.feature_flags.iter().any(|f| f == FLAG_AESSIV)
    }
}

fn wrap_key(kdf: &ScryptKdf, password: &[u8], master: &MasterKey) -> Result<String> {
    let kek = kdf.derive(password)?;
    let core = CryptoCore::new(&kek, AeadVariant::Gcm)?;
    let nonce: [u8; NONCE_SIZE] = crate::crypto::random_array();
    let mut blob = Vec::with_capacity(NONCE_SIZE + KEY_SIZE + crate::crypto::TAG_SIZE);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&core.encrypt(&nonce, &[], master.bytes())?);
    Ok(BASE64_STANDARD.encode(blob))
}

/// Path of the config file inside a cipher directory.
pub fn conf_path(cipher_dir: &Path) -> PathBuf {
    cipher_dir.join(CONF_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_LOG_N: u8 = 10;

    #[test]
    fn test_create_unwrap_roundtrip() {
        let (conf, master) = CryptConf::create_with_log_n(b"secret", false, TEST_LOG_N).unwrap();
        let unwrapped = conf.unwrap_key(b"secret").unwrap();
        assert_eq!(unwrapped.bytes(), master.bytes());
        assert!(!conf.is_aessiv());
    }

    #[test]
    fn test_wrong_password_fails() {
        let (conf, _) = CryptConf::create_with_log_n(b"secret", false, TEST_LOG_N).unwrap();
        assert!(matches!(
            conf.unwrap_key(b"wrong"),
            Err(Error::WrongPassword)
        ));
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(
            CryptConf::create_with_log_n(b"", false, TEST_LOG_N),
            Err(Error::PasswordEmpty)
        ));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = conf_path(dir.path());
        let (conf, master) = CryptConf::create_with_log_n(b"pw", true, TEST_LOG_N).unwrap();
        conf.save(&path).unwrap();

        let loaded = CryptConf::load(&path).unwrap();
        assert!(loaded.is_aessiv());
        assert_eq!(loaded.version, CONF_VERSION);
        assert_eq!(
            loaded.unwrap_key(b"pw").unwrap().bytes(),
            master.bytes()
        );
    }

    #[test]
    fn test_load_rejects_unknown_flag() {
        let dir = TempDir::new().unwrap();
        let path = conf_path(dir.path());
        let (mut conf, _) = CryptConf::create_with_log_n(b"pw", false, TEST_LOG_N).unwrap();
        conf.feature_flags.push("FancyFutureFeature".to_string());
        conf.save(&path).unwrap();

        assert!(matches!(CryptConf::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_rejects_bad_version() {
        let dir = TempDir::new().unwrap();
        let path = conf_path(dir.path());
        let (mut conf, _) = CryptConf::create_with_log_n(b"pw", false, TEST_LOG_N).unwrap();
        conf.version = 99;
        conf.save(&path).unwrap();

        assert!(matches!(CryptConf::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_rewrap_changes_password() {
        let (mut conf, master) = CryptConf::create_with_log_n(b"old", false, TEST_LOG_N).unwrap();
        conf.rewrap(b"old", b"new").unwrap();

        assert_eq!(conf.unwrap_key(b"new").unwrap().bytes(), master.bytes());
        assert!(conf.unwrap_key(b"old").is_err());
    }

    #[test]
    fn test_rewrap_requires_old_password() {
        let (mut conf, _) = CryptConf::create_with_log_n(b"old", false, TEST_LOG_N).unwrap();
        assert!(conf.rewrap(b"wrong", b"new").is_err());
    }
}
