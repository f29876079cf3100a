//! Error types for cloakfs

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cloakfs
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("authentication failed")]
    AuthFailed,

    #[error("block {block} failed authentication")]
    BadBlock { block: u64 },

    #[error("undecryptable name")]
    BadName,

    #[error("corrupt ciphertext: {0}")]
    Corrupt(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("master key unwrap failed (wrong password?)")]
    WrongPassword,

    // Filesystem errors
    #[error("file opened write-only")]
    WriteOnly,

    #[error("file handle already released")]
    Released,

    #[error("operation not supported")]
    Unsupported,

    #[error("extended attribute outside the user namespace: {0}")]
    XattrNamespace(String),

    /// Internal sentinel: a write at `offset` would leave a hole behind it.
    /// The file layer converts this into an explicit zero-pad pass; it must
    /// never reach a caller.
    #[error("write at offset {offset} would punch a hole past size {size}")]
    HolePunch { offset: u64, size: u64 },

    // Password errors
    #[error("password error: {0}")]
    Password(String),

    #[error("password is empty")]
    PasswordEmpty,

    // Config errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Backing filesystem errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("syscall failed: {0}")]
    Sys(#[from] nix::Error),
}

impl Error {
    /// Convert to libc errno for the kernel-facing surface.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::AuthFailed
            | Error::BadBlock { .. }
            | Error::BadName
            | Error::Corrupt(_)
            | Error::HolePunch { .. } => libc::EIO,
            Error::WriteOnly | Error::Released => libc::EBADF,
            Error::Unsupported => libc::EOPNOTSUPP,
            Error::XattrNamespace(_) => libc::EPERM,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Sys(e) => *e as libc::c_int,
            _ => libc::EIO,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
