//! cloakfs - encrypted overlay filesystem core
//!
//! This library presents a plaintext view of a directory tree whose contents
//! and filenames are persisted as ciphertext in a backing ("cipher")
//! directory. File contents are stored as authenticated 4 KiB blocks behind
//! an 18-byte per-file header; filenames are encrypted deterministically
//! under a per-directory IV. The kernel-facing adapter is not part of this
//! crate; it consumes the per-file I/O type and the backing-dir resolver
//! exposed here.

pub mod cache;
pub mod config;
pub mod contentenc;
pub mod crypto;
pub mod error;
pub mod exitcodes;
pub mod fs;
pub mod names;
pub mod readpass;

pub use config::CryptConf;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::CryptConf;
    pub use crate::crypto::MasterKey;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{CryptFile, MountCtx};
}
