//! Extended attribute forwarding
//!
//! Only the "user." namespace crosses the encryption boundary. "trusted."
//! and "security." attributes are interpreted by the system, and we do not
//! want it chewing on our encrypted garbage. All calls run through
//! `/proc/self/fd/<dirfd>/<name>` so a rename between path resolution and
//! the xattr syscall cannot redirect them, and use the l* variants so
//! symlinks are never followed.

use crate::error::{Error, Result};
use crate::fs::compat::proc_fd_path;
use nix::errno::Errno;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

/// The only xattr namespace we forward.
pub const XATTR_USER_PREFIX: &str = "user.";

/// Reject attribute names outside the user namespace.
pub fn check_namespace(attr: &str) -> Result<()> {
    if !attr.starts_with(XATTR_USER_PREFIX) {
        return Err(Error::XattrNamespace(attr.to_string()));
    }
    Ok(())
}

fn c_path(dirfd: RawFd, cname: &str) -> Result<CString> {
    CString::new(proc_fd_path(dirfd, cname).as_os_str().as_bytes()).map_err(|_| Error::BadName)
}

fn c_attr(attr: &str) -> Result<CString> {
    CString::new(attr).map_err(|_| Error::BadName)
}

/// Read an extended attribute of the file `cname` in the directory open at
/// `dirfd`.
pub fn get_xattr(dirfd: RawFd, cname: &str, attr: &str) -> Result<Vec<u8>> {
    check_namespace(attr)?;
    let path = c_path(dirfd, cname)?;
    let attr = c_attr(attr)?;
    loop {
        let size = unsafe {
            libc::lgetxattr(path.as_ptr(), attr.as_ptr(), std::ptr::null_mut(), 0)
        };
        if size < 0 {
            return Err(Errno::last().into());
        }
        let mut buf = vec![0u8; size as usize];
        let n = unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                attr.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            // The value grew between the two calls.
            if Errno::last() == Errno::ERANGE {
                continue;
            }
            return Err(Errno::last().into());
        }
        buf.truncate(n as usize);
        return Ok(buf);
    }
}

/// Set an extended attribute.
pub fn set_xattr(dirfd: RawFd, cname: &str, attr: &str, data: &[u8], flags: libc::c_int) -> Result<()> {
    check_namespace(attr)?;
    let path = c_path(dirfd, cname)?;
    let attr = c_attr(attr)?;
    let res = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            attr.as_ptr(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            flags,
        )
    };
    if res < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// Remove an extended attribute.
pub fn remove_xattr(dirfd: RawFd, cname: &str, attr: &str) -> Result<()> {
    check_namespace(attr)?;
    let path = c_path(dirfd, cname)?;
    let attr = c_attr(attr)?;
    let res = unsafe { libc::lremovexattr(path.as_ptr(), attr.as_ptr()) };
    if res < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// List extended attributes, filtered to the user namespace.
pub fn list_xattr(dirfd: RawFd, cname: &str) -> Result<Vec<String>> {
    let path = c_path(dirfd, cname)?;
    loop {
        let size = unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(Errno::last().into());
        }
        let mut buf = vec![0u8; size as usize];
        let n = unsafe {
            libc::llistxattr(path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if n < 0 {
            if Errno::last() == Errno::ERANGE {
                continue;
            }
            return Err(Errno::last().into());
        }
        buf.truncate(n as usize);
        let names = buf
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .filter_map(|s| String::from_utf8(s.to_vec()).ok())
            .filter(|s| s.starts_with(XATTR_USER_PREFIX))
            .collect();
        return Ok(names);
    }
}
