//! Syscall helpers
//!
//! Wraps the raw syscalls the I/O path depends on: EINTR-transparent
//! positioned reads and writes, ENOSPC pre-reservation, chmod without
//! following symlinks, and the per-thread credential swap used to create
//! files on behalf of the calling user.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{openat, FallocateFlags, OFlag};
use nix::sys::stat::{fchmodat, fstat, FchmodatFlags, Mode, SFlag};
use nix::unistd::close;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Once;
use tracing::warn;

/// Retry a syscall while it reports EINTR. Getting interrupted by a signal
/// is not an error, it just means "try again".
pub fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Positioned read that loops over short reads and EINTR. Returns the
/// number of bytes read, which is short only at end of file.
pub fn pread_full(fd: RawFd, buf: &mut [u8], offset: u64) -> nix::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match nix::sys::uio::pread(fd, &mut buf[done..], (offset as usize + done) as libc::off_t) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Positioned write of the whole buffer, looping over short writes and
/// EINTR.
pub fn pwrite_full(fd: RawFd, buf: &[u8], offset: u64) -> nix::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match nix::sys::uio::pwrite(fd, &buf[done..], (offset as usize + done) as libc::off_t) {
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

static PREALLOC_WARN: Once = Once::new();

/// Reserve ciphertext space without changing the file size. Running out of
/// space in the middle of a block write leaves a half-written block that
/// can never be read back, so the space is claimed up front. Filesystems
/// without fallocate (ZFS, ext3) get a one-time warning and no reservation.
pub fn prealloc(fd: RawFd, offset: u64, len: u64) -> nix::Result<()> {
    if len == 0 {
        return Ok(());
    }
    loop {
        match nix::fcntl::fallocate(
            fd,
            FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        ) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EOPNOTSUPP) => {
                PREALLOC_WARN.call_once(|| {
                    warn!(
                        "the backing filesystem does not support fallocate(2); \
                         continuing without out-of-space protection"
                    );
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Path under /proc that resolves to the file `name` inside the directory
/// open at `dirfd`. Lets us run path-based syscalls (chmod, xattr) without
/// racing against renames of ancestor directories.
pub fn proc_fd_path(dirfd: RawFd, name: &str) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}/{}", dirfd, name))
}

/// Make sure descriptors 0, 1 and 2 are open, so the kernel can never hand
/// them out for regular files. A stray write to a "closed" stderr would
/// otherwise corrupt whatever file ended up with descriptor 2.
pub fn ensure_fds_012() -> Result<()> {
    loop {
        let fd = nix::fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
        if fd > 2 {
            close(fd)?;
            return Ok(());
        }
        // Deliberately kept open for the lifetime of the process.
    }
}

/// Credentials of the kernel caller a syscall should run as.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

// The glibc set*id wrappers broadcast the change to every thread of the
// process; these raw syscalls change only the calling thread. Rust threads
// are OS threads, so no extra pinning is needed, but the guard below must
// never migrate: it is !Send.
fn thread_setregid(egid: libc::gid_t) -> nix::Result<()> {
    let res = unsafe { libc::syscall(libc::SYS_setregid, -1i64, egid as i64) };
    if res == -1 {
        return Err(Errno::last());
    }
    Ok(())
}

fn thread_setreuid(euid: libc::uid_t) -> nix::Result<()> {
    let res = unsafe { libc::syscall(libc::SYS_setreuid, -1i64, euid as i64) };
    if res == -1 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Scoped effective-uid/gid swap for the current thread. Dropping the guard
/// restores root credentials; if that fails the process aborts, because
/// continuing with a borrowed identity corrupts every later operation on
/// this thread.
struct EidGuard {
    _not_send: PhantomData<*mut ()>,
}

impl EidGuard {
    fn new(caller: &Caller) -> nix::Result<Self> {
        // gid first: once the effective uid is unprivileged, setregid would
        // be refused.
        thread_setregid(caller.gid)?;
        if let Err(e) = thread_setreuid(caller.uid) {
            if thread_setregid(0).is_err() {
                abort_identity();
            }
            return Err(e);
        }
        Ok(EidGuard {
            _not_send: PhantomData,
        })
    }
}

impl Drop for EidGuard {
    fn drop(&mut self) {
        if thread_setreuid(0).is_err() || thread_setregid(0).is_err() {
            abort_identity();
        }
    }
}

fn abort_identity() -> ! {
    // Not a recoverable state: the thread is stuck with the caller's
    // credentials.
    eprintln!("fatal: could not restore process credentials");
    std::process::abort();
}

/// `openat` running with the caller's effective uid/gid, so the new file
/// gets the right owner.
pub fn openat_user(
    dirfd: RawFd,
    name: &str,
    flags: OFlag,
    mode: Mode,
    caller: Option<&Caller>,
) -> Result<RawFd> {
    let _guard = caller.map(EidGuard::new).transpose()?;
    Ok(retry_eintr(|| openat(dirfd, name, flags, mode))?)
}

/// `mkdirat` as the calling user.
pub fn mkdirat_user(dirfd: RawFd, name: &str, mode: Mode, caller: Option<&Caller>) -> Result<()> {
    let _guard = caller.map(EidGuard::new).transpose()?;
    nix::sys::stat::mkdirat(dirfd, name, mode)?;
    Ok(())
}

/// `symlinkat` as the calling user.
pub fn symlinkat_user(
    target: &str,
    dirfd: RawFd,
    name: &str,
    caller: Option<&Caller>,
) -> Result<()> {
    let _guard = caller.map(EidGuard::new).transpose()?;
    nix::unistd::symlinkat(target, Some(dirfd), name)?;
    Ok(())
}

/// `mknodat` as the calling user.
pub fn mknodat_user(
    dirfd: RawFd,
    name: &str,
    kind: SFlag,
    perm: Mode,
    dev: libc::dev_t,
    caller: Option<&Caller>,
) -> Result<()> {
    let _guard = caller.map(EidGuard::new).transpose()?;
    nix::sys::stat::mknodat(dirfd, name, kind, perm, dev)?;
    Ok(())
}

/// chmod that never follows symlinks. Linux does not implement
/// AT_SYMLINK_NOFOLLOW for fchmodat, so this opens an O_PATH handle,
/// verifies it is not a symlink, and chmods through /proc/self/fd.
pub fn fchmodat_nofollow(dirfd: RawFd, name: &str, mode: Mode) -> Result<()> {
    let fd = retry_eintr(|| {
        openat(
            dirfd,
            name,
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
    })?;
    let res = fchmod_via_proc(fd, mode);
    let _ = close(fd);
    res
}

fn fchmod_via_proc(fd: RawFd, mode: Mode) -> Result<()> {
    let st = fstat(fd)?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFLNK {
        return Err(Error::Sys(Errno::ELOOP));
    }
    // fchmod refuses O_PATH descriptors; the /proc path does not.
    let path = PathBuf::from(format!("/proc/self/fd/{}", fd));
    fchmodat(None, &path, mode, FchmodatFlags::FollowSymlink)?;
    Ok(())
}
