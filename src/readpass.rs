//! Password acquisition
//!
//! A password comes from one of three places, in order of preference:
//! an explicit password file, a terminal prompt, or stdin when stdin is
//! not a terminal (scripted use). Only the first line counts, the length
//! is capped at 2 KiB, and an empty password is always an error.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Maximum accepted password length in bytes.
pub const MAX_PASSWORD_LEN: usize = 2048;

/// Read the password once.
pub fn once(passfile: Option<&Path>, prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(path) = passfile {
        return read_passfile(path);
    }
    if !stdin_is_tty() {
        info!("reading password from stdin");
        return read_line_capped(&mut std::io::stdin());
    }
    prompt_terminal(&format!("{}: ", prompt))
}

/// Read the password, prompting twice for confirmation when it comes from
/// a terminal.
pub fn twice(passfile: Option<&Path>) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(path) = passfile {
        return read_passfile(path);
    }
    if !stdin_is_tty() {
        info!("reading password from stdin");
        return read_line_capped(&mut std::io::stdin());
    }
    let p1 = prompt_terminal("Password: ")?;
    let p2 = prompt_terminal("Repeat: ")?;
    if p1 != p2 {
        return Err(Error::Password("passwords do not match".to_string()));
    }
    Ok(p1)
}

/// First line of `path`, with trailing garbage ignored (but warned about).
fn read_passfile(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    info!("reading password from file {:?}", path);
    let mut file = File::open(path)
        .map_err(|e| Error::Password(format!("cannot open {}: {}", path.display(), e)))?;
    // +1 for an optional trailing newline, +1 more so an over-long
    // password is detectable.
    let mut buf = Zeroizing::new(vec![0u8; MAX_PASSWORD_LEN + 2]);
    let mut n = 0;
    while n < buf.len() {
        match file.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::Password(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    let line_end = buf[..n].iter().position(|&b| b == b'\n').unwrap_or(n);
    if line_end == 0 {
        return Err(Error::PasswordEmpty);
    }
    if line_end > MAX_PASSWORD_LEN {
        return Err(Error::Password(format!(
            "password exceeds {} bytes",
            MAX_PASSWORD_LEN
        )));
    }
    if n > line_end + 1 {
        warn!(
            "ignoring {} bytes of trailing garbage after the first line",
            n - line_end - 1
        );
    }
    Ok(Zeroizing::new(buf[..line_end].to_vec()))
}

/// Read single bytes until newline or EOF, capped at MAX_PASSWORD_LEN.
/// Unbuffered on purpose: nothing after the password must be consumed.
fn read_line_capped(r: &mut impl Read) -> Result<Zeroizing<Vec<u8>>> {
    let mut line = Zeroizing::new(Vec::new());
    let mut byte = [0u8; 1];
    loop {
        if line.len() > MAX_PASSWORD_LEN {
            return Err(Error::Password(format!(
                "password exceeds {} bytes",
                MAX_PASSWORD_LEN
            )));
        }
        match r.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Password(e.to_string())),
        }
    }
    if line.is_empty() {
        return Err(Error::PasswordEmpty);
    }
    Ok(line)
}

fn prompt_terminal(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let mut pw = rpassword::prompt_password(prompt)
        .map_err(|e| Error::Password(format!("terminal read failed: {}", e)))?;
    let bytes = Zeroizing::new(pw.as_bytes().to_vec());
    pw.zeroize();
    if bytes.is_empty() {
        return Err(Error::PasswordEmpty);
    }
    if bytes.len() > MAX_PASSWORD_LEN {
        return Err(Error::Password(format!(
            "password exceeds {} bytes",
            MAX_PASSWORD_LEN
        )));
    }
    Ok(bytes)
}

fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}
