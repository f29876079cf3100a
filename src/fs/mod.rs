//! Filesystem layer: per-file I/O, path resolution and syscall plumbing.

pub mod compat;
pub mod file;
pub mod paths;
pub mod xattr;

pub use compat::Caller;
pub use file::CryptFile;
pub use paths::MountCtx;
