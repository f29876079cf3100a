//! Backing-directory resolution
//!
//! [`MountCtx`] is the explicit context value carrying everything with
//! mount lifetime: the content encryption engine, the name transform, the
//! open descriptor of the cipher root and the directory cache. There are no
//! ambient singletons.
//!
//! [`MountCtx::open_backing_dir`] turns a plaintext relative path into an
//! `O_PATH` descriptor of the parent ciphertext directory plus the
//! ciphertext basename. Working from that descriptor (openat, /proc paths)
//! keeps operations immune against concurrent renames of ancestors.

use crate::cache::DirCache;
use crate::contentenc::ContentEnc;
use crate::crypto::{AeadVariant, CryptoCore, MasterKey};
use crate::error::{Error, Result};
use crate::fs::compat;
use crate::names::{read_diriv_at, HashedName, NameTransform, DIRIV_LEN};
use nix::fcntl::{open, openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::dup;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Per-mount state: keys, engines, caches and the cipher-root descriptor.
pub struct MountCtx {
    root: OwnedFd,
    pub enc: Arc<ContentEnc>,
    pub names: NameTransform,
    pub dircache: DirCache,
}

impl MountCtx {
    /// Build the mount context from the unwrapped master key. `siv_mode`
    /// selects the deterministic content AEAD used by reverse mounts.
    pub fn new(cipher_dir: &Path, master: &MasterKey, siv_mode: bool) -> Result<Self> {
        let variant = if siv_mode {
            AeadVariant::GcmSiv
        } else {
            AeadVariant::Gcm
        };
        let core = CryptoCore::new(&*master.content_key()?, variant)?;
        let names = NameTransform::new(&*master.name_key()?)?;
        let root = open(
            cipher_dir,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(MountCtx {
            root: unsafe { OwnedFd::from_raw_fd(root) },
            enc: Arc::new(ContentEnc::new(core)),
            names,
            dircache: DirCache::new(),
        })
    }

    /// Resolve `rel_path` to `(parent ciphertext dirfd, ciphertext
    /// basename)`. The caller owns the returned descriptor. For the root
    /// itself the basename is ".".
    pub fn open_backing_dir(&self, rel_path: &str) -> Result<(OwnedFd, HashedName)> {
        validate_rel_path(rel_path)?;
        let (parent, base) = split_path(rel_path);
        if base.is_empty() {
            let fd = compat::retry_eintr(|| dup(self.root.as_raw_fd()))?;
            return Ok((
                unsafe { OwnedFd::from_raw_fd(fd) },
                HashedName::Short(".".to_string()),
            ));
        }

        if let Some((fd, iv)) = self.dircache.lookup(parent) {
            let cname = self.names.encrypt_and_hash(base, &iv)?;
            return Ok((fd, cname));
        }

        let (fd, iv) = self.walk_to_dir(parent)?;
        self.dircache.store(parent, fd.as_raw_fd(), &iv);
        let cname = self.names.encrypt_and_hash(base, &iv)?;
        Ok((fd, cname))
    }

    /// Walk the ciphertext tree down to the plaintext directory `rel_dir`,
    /// reading each directory's IV along the way. Returns an `O_PATH`
    /// descriptor and the IV of the final directory.
    fn walk_to_dir(&self, rel_dir: &str) -> Result<(OwnedFd, [u8; DIRIV_LEN])> {
        debug!(rel_dir, "walking backing tree");
        let fd = compat::retry_eintr(|| dup(self.root.as_raw_fd()))?;
        let mut cur = unsafe { OwnedFd::from_raw_fd(fd) };
        for comp in rel_dir.split('/').filter(|c| !c.is_empty()) {
            let iv = read_diriv_at(cur.as_raw_fd())?;
            let cname = self.names.encrypt_and_hash(comp, &iv)?;
            let next = compat::retry_eintr(|| {
                openat(
                    cur.as_raw_fd(),
                    cname.stored(),
                    OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                    Mode::empty(),
                )
            })?;
            cur = unsafe { OwnedFd::from_raw_fd(next) };
        }
        let iv = read_diriv_at(cur.as_raw_fd())?;
        Ok((cur, iv))
    }
}

/// Split a plaintext relative path into parent directory and basename.
/// `""` means the root. Leading, trailing and doubled slashes are not
/// expected from the kernel-facing layer; reject paths trying to escape.
fn split_path(rel_path: &str) -> (&str, &str) {
    let rel_path = rel_path.trim_matches('/');
    match rel_path.rsplit_once('/') {
        Some((parent, base)) => (parent, base),
        None => ("", rel_path),
    }
}

// Keep ".." out of backing paths; the plaintext layer resolves dots before
// calling us, anything left is an escape attempt.
pub(crate) fn validate_rel_path(rel_path: &str) -> Result<()> {
    if rel_path
        .split('/')
        .any(|c| c == "." || c == "..")
    {
        return Err(Error::BadName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::{create_diriv_at, DIRIV_NAME};
    use nix::sys::stat::fstat;
    use std::fs;
    use std::os::linux::fs::MetadataExt;
    use tempfile::TempDir;

    fn new_ctx(dir: &TempDir) -> MountCtx {
        let master = MasterKey::random();
        MountCtx::new(dir.path(), &master, false).unwrap()
    }

    /// Create the ciphertext counterpart of plaintext directory `plain`
    /// under `parent`, including its IV file. Returns the ciphertext path.
    fn make_cipher_dir(
        ctx: &MountCtx,
        parent: &std::path::Path,
        parent_iv: &[u8; DIRIV_LEN],
        plain: &str,
    ) -> std::path::PathBuf {
        let cname = ctx.names.encrypt_and_hash(plain, parent_iv).unwrap();
        let path = parent.join(cname.stored());
        fs::create_dir(&path).unwrap();
        let fd = nix::fcntl::open(&path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .unwrap();
        create_diriv_at(fd).unwrap();
        nix::unistd::close(fd).unwrap();
        path
    }

    #[test]
    fn test_root_resolution() {
        let dir = TempDir::new().unwrap();
        let ctx = new_ctx(&dir);

        let (fd, cname) = ctx.open_backing_dir("").unwrap();
        assert_eq!(cname.stored(), ".");
        let root_ino = fs::metadata(dir.path()).unwrap().st_ino();
        assert_eq!(fstat(fd.as_raw_fd()).unwrap().st_ino, root_ino);
    }

    #[test]
    fn test_resolve_nested_path() {
        let dir = TempDir::new().unwrap();
        let ctx = new_ctx(&dir);

        // Build the backing tree for plaintext "a/b".
        let root_fd =
            nix::fcntl::open(dir.path(), OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
                .unwrap();
        let root_iv = create_diriv_at(root_fd).unwrap();
        nix::unistd::close(root_fd).unwrap();

        let a_path = make_cipher_dir(&ctx, dir.path(), &root_iv, "a");
        let a_iv = {
            let fd = nix::fcntl::open(&a_path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
                .unwrap();
            let iv = read_diriv_at(fd).unwrap();
            nix::unistd::close(fd).unwrap();
            iv
        };
        let b_path = make_cipher_dir(&ctx, &a_path, &a_iv, "b");

        // Resolving "a/b/file.txt" must hand back b's directory fd plus the
        // name encrypted under b's IV.
        let (fd, cname) = ctx.open_backing_dir("a/b/file.txt").unwrap();
        assert_eq!(
            fstat(fd.as_raw_fd()).unwrap().st_ino,
            fs::metadata(&b_path).unwrap().st_ino()
        );
        let b_iv = {
            let fd = nix::fcntl::open(&b_path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
                .unwrap();
            let iv = read_diriv_at(fd).unwrap();
            nix::unistd::close(fd).unwrap();
            iv
        };
        assert_eq!(
            ctx.names.decrypt_name(cname.stored(), &b_iv).unwrap(),
            "file.txt"
        );

        // Second resolution comes from the cache and still matches.
        let (fd2, cname2) = ctx.open_backing_dir("a/b/file.txt").unwrap();
        assert_eq!(
            fstat(fd2.as_raw_fd()).unwrap().st_ino,
            fs::metadata(&b_path).unwrap().st_ino()
        );
        assert_eq!(cname2.stored(), cname.stored());
        drop(fd);
    }

    #[test]
    fn test_missing_diriv_fails() {
        let dir = TempDir::new().unwrap();
        let ctx = new_ctx(&dir);
        // No diriv in the root: resolving any child must fail.
        assert!(ctx.open_backing_dir("file").is_err());
        assert!(!dir.path().join(DIRIV_NAME).exists());
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path(""), ("", ""));
        assert_eq!(split_path("a"), ("", "a"));
        assert_eq!(split_path("a/b"), ("a", "b"));
        assert_eq!(split_path("a/b/c"), ("a/b", "c"));
        assert_eq!(split_path("/a/b/"), ("a", "b"));
    }

    #[test]
    fn test_validate_rel_path() {
        assert!(validate_rel_path("a/b").is_ok());
        assert!(validate_rel_path("a/../b").is_err());
        assert!(validate_rel_path("./a").is_err());
    }
}
