//! Long-name stand-ins
//!
//! An encoded filename longer than NAME_MAX cannot be stored directly.
//! The on-disk entry becomes `gocryptfs.longname.<b64(sha256(name))>` and
//! the full encoded name goes into a `.name` sidecar next to it, so that
//! directory listings can recover the original name.

use crate::error::{Error, Result};
use crate::names::{LONGNAME_PREFIX, LONGNAME_SUFFIX};
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use nix::errno::Errno;
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, unlinkat, UnlinkatFlags};
use ring::digest::{digest, SHA256};
use std::os::unix::io::RawFd;
use tracing::warn;

// An encrypted 255-byte name grows to 16 bytes of SIV tag plus the name,
// about 362 bytes of base64. 4096 leaves plenty of headroom.
const MAX_SIDECAR_LEN: usize = 4096;

/// Compute the on-disk stand-in for an over-long encoded name.
pub fn hash_long_name(cipher_name: &str) -> String {
    let hash = digest(&SHA256, cipher_name.as_bytes());
    format!(
        "{}{}",
        LONGNAME_PREFIX,
        BASE64_URL_SAFE_NO_PAD.encode(hash.as_ref())
    )
}

fn sidecar_name(stored: &str) -> String {
    format!("{}{}", stored, LONGNAME_SUFFIX)
}

/// Write the `.name` sidecar for `stored` in the directory open at `dirfd`.
/// The sidecar content is deterministic, so an already-existing sidecar is
/// fine.
pub fn write_longname_file(dirfd: RawFd, stored: &str, cipher_name: &str) -> Result<()> {
    let sidecar = sidecar_name(stored);
    let fd = match openat(
        dirfd,
        sidecar.as_str(),
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR,
    ) {
        Ok(fd) => fd,
        Err(Errno::EEXIST) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let write_res = write_all(fd, cipher_name.as_bytes());
    let close_res = close(fd);
    if let Err(e) = write_res.and(close_res.map_err(Error::from)) {
        warn!("longname sidecar write failed, removing: {}", e);
        if let Err(e) = unlinkat(Some(dirfd), sidecar.as_str(), UnlinkatFlags::NoRemoveDir) {
            warn!("could not remove incomplete sidecar: {}", e);
        }
        return Err(e);
    }
    Ok(())
}

/// Read the full encoded name back from the `.name` sidecar of `stored`.
pub fn read_longname_file(dirfd: RawFd, stored: &str) -> Result<String> {
    let sidecar = sidecar_name(stored);
    let fd = openat(
        dirfd,
        sidecar.as_str(),
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let res = read_sidecar(fd);
    let _ = close(fd);
    res
}

fn read_sidecar(fd: RawFd) -> Result<String> {
    let mut buf = vec![0u8; MAX_SIDECAR_LEN + 1];
    let mut n = 0;
    while n < buf.len() {
        match nix::unistd::read(fd, &mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if n == 0 || n > MAX_SIDECAR_LEN {
        return Err(Error::Corrupt(format!("longname sidecar has {} bytes", n)));
    }
    buf.truncate(n);
    let name = String::from_utf8(buf).map_err(|_| Error::BadName)?;
    if name.contains('/') || name.contains('\0') {
        return Err(Error::BadName);
    }
    Ok(name)
}

/// Remove the `.name` sidecar of `stored`.
pub fn delete_longname_file(dirfd: RawFd, stored: &str) -> Result<()> {
    unlinkat(
        Some(dirfd),
        sidecar_name(stored).as_str(),
        UnlinkatFlags::NoRemoveDir,
    )?;
    Ok(())
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
