//! Per-directory IV sidecar
//!
//! Every ciphertext directory carries a `gocryptfs.diriv` file holding the
//! 16 random bytes used as the nonce for filename encryption in that
//! directory. All access goes through an open directory descriptor so that
//! a rename of an ancestor between lookup and IV read cannot make us use
//! the wrong IV.

use crate::error::{Error, Result};
use crate::names::{DIRIV_LEN, DIRIV_NAME};
use nix::errno::Errno;
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, unlinkat, UnlinkatFlags};
use std::os::unix::io::RawFd;
use tracing::warn;

/// Read and validate `gocryptfs.diriv` in the directory open at `dirfd`.
pub fn read_diriv_at(dirfd: RawFd) -> Result<[u8; DIRIV_LEN]> {
    let fd = openat(
        dirfd,
        DIRIV_NAME,
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let res = read_iv(fd);
    let _ = close(fd);
    res
}

fn read_iv(fd: RawFd) -> Result<[u8; DIRIV_LEN]> {
    // One byte more than needed, so an oversized file is detected.
    let mut buf = [0u8; DIRIV_LEN + 1];
    let mut n = 0;
    while n < buf.len() {
        match nix::unistd::read(fd, &mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if n != DIRIV_LEN {
        return Err(Error::Corrupt(format!(
            "diriv has {} bytes, want {}",
            n, DIRIV_LEN
        )));
    }
    if buf[..DIRIV_LEN].iter().all(|&b| b == 0) {
        return Err(Error::Corrupt("diriv is all-zero".to_string()));
    }
    let mut iv = [0u8; DIRIV_LEN];
    iv.copy_from_slice(&buf[..DIRIV_LEN]);
    Ok(iv)
}

/// Create a fresh `gocryptfs.diriv` in the directory open at `dirfd` and
/// return the IV. The file is created atomically with mode 0400 and is
/// unlinked again if the write does not complete.
pub fn create_diriv_at(dirfd: RawFd) -> Result<[u8; DIRIV_LEN]> {
    let iv: [u8; DIRIV_LEN] = crate::crypto::random_array();
    let fd = openat(
        dirfd,
        DIRIV_NAME,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
        Mode::S_IRUSR,
    )?;
    let write_res = write_all(fd, &iv);
    let close_res = close(fd);
    if let Err(e) = write_res.and(close_res.map_err(Error::from)) {
        // Getting ENOSPC here is normal; do not leave a truncated IV behind.
        warn!("diriv write failed, removing incomplete file: {}", e);
        if let Err(e) = unlinkat(Some(dirfd), DIRIV_NAME, UnlinkatFlags::NoRemoveDir) {
            warn!("could not remove incomplete diriv: {}", e);
        }
        return Err(e);
    }
    Ok(iv)
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

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::open;
    use std::fs;
    use tempfile::TempDir;

    fn open_dir(dir: &TempDir) -> RawFd {
        open(
            dir.path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dirfd = open_dir(&dir);

        let created = create_diriv_at(dirfd).unwrap();
        let read = read_diriv_at(dirfd).unwrap();
        assert_eq!(created, read);

        let meta = fs::metadata(dir.path().join(DIRIV_NAME)).unwrap();
        assert_eq!(meta.len(), DIRIV_LEN as u64);

        close(dirfd).unwrap();
    }

    #[test]
    fn test_create_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let dirfd = open_dir(&dir);

        create_diriv_at(dirfd).unwrap();
        assert!(create_diriv_at(dirfd).is_err());

        close(dirfd).unwrap();
    }

    #[test]
    fn test_read_rejects_missing() {
        let dir = TempDir::new().unwrap();
        let dirfd = open_dir(&dir);
        assert!(read_diriv_at(dirfd).is_err());
        close(dirfd).unwrap();
    }

    #[test]
    fn test_read_rejects_wrong_size() {
        let dir = TempDir::new().unwrap();
        let dirfd = open_dir(&dir);

        fs::write(dir.path().join(DIRIV_NAME), [1u8; 8]).unwrap();
        assert!(matches!(read_diriv_at(dirfd), Err(Error::Corrupt(_))));

        fs::write(dir.path().join(DIRIV_NAME), [1u8; 17]).unwrap();
        assert!(matches!(read_diriv_at(dirfd), Err(Error::Corrupt(_))));

        close(dirfd).unwrap();
    }

    #[test]
    fn test_read_rejects_all_zero() {
        let dir = TempDir::new().unwrap();
        let dirfd = open_dir(&dir);

        fs::write(dir.path().join(DIRIV_NAME), [0u8; DIRIV_LEN]).unwrap();
        assert!(matches!(read_diriv_at(dirfd), Err(Error::Corrupt(_))));

        close(dirfd).unwrap();
    }
}
