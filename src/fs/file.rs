//! Per-open-file I/O
//!
//! [`CryptFile`] wraps one open descriptor of a ciphertext backing file and
//! serves plaintext-addressed reads, writes and truncates over it. All
//! address arithmetic and block crypto is delegated to
//! [`ContentEnc`](crate::contentenc::ContentEnc); this module owns the
//! descriptor, the lazily initialized file header, and the
//! read-modify-write orchestration.
//!
//! Every operation holds the per-file mutex for its whole duration, so a
//! read racing a write through the same handle sees either the old or the
//! new content of every touched block, never a mix. Writers through
//! *different* open handles of the same inode race at block granularity;
//! the last writer wins per block.

use crate::contentenc::{ContentEnc, FileHeader, CIPHER_BS, PLAIN_BS};
use crate::error::{Error, Result};
use crate::fs::compat;
use nix::sys::stat::{fstat, FileStat};
use nix::sys::time::TimeSpec;
use nix::unistd::{close, dup, ftruncate};
use parking_lot::Mutex;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zeroize::Zeroize;

/// One open file. Create one per `open()` callback; drop (or
/// [`release`](Self::release)) it on the matching close.
pub struct CryptFile {
    /// Was the file opened O_WRONLY?
    write_only: bool,
    /// Backing inode number, for log messages.
    ino: u64,
    enc: Arc<ContentEnc>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Backing descriptor; `None` after release.
    fd: Option<OwnedFd>,
    /// File ID from the header, cached after the first read or write.
    header: Option<FileHeader>,
}

impl Inner {
    fn fd(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::Released)
    }
}

impl CryptFile {
    pub fn new(fd: OwnedFd, write_only: bool, enc: Arc<ContentEnc>) -> Result<Self> {
        let st = fstat(fd.as_raw_fd())?;
        Ok(CryptFile {
            write_only,
            ino: st.st_ino,
            enc,
            inner: Mutex::new(Inner {
                fd: Some(fd),
                header: None,
            }),
        })
    }

    /// Inode of the backing file.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Read `len` plaintext bytes at plaintext offset `off`. Reads starting
    /// past the end of file return an empty buffer; reads straddling it
    /// return only the bytes that exist.
    pub fn read(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        debug!(ino = self.ino, off, len, "read");
        if self.write_only {
            warn!(ino = self.ino, "tried to read from write-only file");
            return Err(Error::WriteOnly);
        }
        let mut inner = self.inner.lock();
        self.do_read(&mut inner, off, len)
    }

    /// Write `data` at plaintext offset `off`, zero-padding first if the
    /// offset lies past the end of file. Returns the number of bytes
    /// written.
    pub fn write(&self, data: &[u8], off: u64) -> Result<usize> {
        debug!(ino = self.ino, off, len = data.len(), "write");
        if data.is_empty() {
            // Must not allocate a header for a file that stays empty.
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let size = self.plain_size(&inner)?;
        if let Err(Error::HolePunch { .. }) = ContentEnc::check_no_hole(size, off) {
            debug!(ino = self.ino, size, off, "zero-padding up to write offset");
            self.zero_pad(&mut inner, size, off)?;
        }
        self.do_write(&mut inner, data, off)
    }

    /// Truncate the file to `new_size` plaintext bytes.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let fd = inner.fd()?;
        let old_size = self.plain_size(&inner)?;
        debug!(ino = self.ino, old_size, new_size, "truncate");
        if new_size == old_size {
            return Ok(());
        }
        if new_size == 0 {
            compat::retry_eintr(|| ftruncate(fd, 0))?;
            // The backing file is empty again; the next write starts a new
            // header with a fresh file ID.
            inner.header = None;
            return Ok(());
        }
        if new_size > old_size {
            self.grow(&mut inner, old_size, new_size)
        } else {
            self.shrink(&mut inner, new_size)
        }
    }

    /// Make close() notifications reach the backing filesystem without
    /// closing the descriptor, which may still be shared by other open
    /// handles of this file: close a duplicate instead.
    ///
    /// Deliberately does not fsync; callers that need durability must call
    /// [`fsync`](Self::fsync).
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        let fd = inner.fd()?;
        let dup_fd = compat::retry_eintr(|| dup(fd))?;
        close(dup_fd)?;
        Ok(())
    }

    /// Close the backing descriptor. Every later operation fails.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.fd.take();
    }

    pub fn fsync(&self) -> Result<()> {
        let inner = self.inner.lock();
        let fd = inner.fd()?;
        compat::retry_eintr(|| nix::unistd::fsync(fd))?;
        Ok(())
    }

    /// Stat the backing file with the size translated to plaintext bytes.
    pub fn getattr(&self) -> Result<FileStat> {
        let inner = self.inner.lock();
        let mut st = fstat(inner.fd()?)?;
        st.st_size = ContentEnc::plain_size(st.st_size as u64)? as libc::off_t;
        Ok(st)
    }

    /// fallocate(2) has no sensible meaning on the encrypted block format.
    pub fn allocate(&self, _off: u64, _len: u64) -> Result<()> {
        warn!(ino = self.ino, "fallocate is not supported on encrypted files");
        Err(Error::Unsupported)
    }

    /// Update atime/mtime through the open descriptor. `None` leaves a
    /// timestamp untouched.
    pub fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<()> {
        let inner = self.inner.lock();
        let fd = inner.fd()?;
        nix::sys::stat::futimens(fd, &to_timespec(atime), &to_timespec(mtime))?;
        Ok(())
    }

    fn plain_size(&self, inner: &Inner) -> Result<u64> {
        let st = fstat(inner.fd()?)?;
        ContentEnc::plain_size(st.st_size as u64)
    }

    /// Read the header, caching the file ID. `None` means the backing file
    /// is empty (a plaintext-empty file has no header).
    fn get_header(&self, inner: &mut Inner) -> Result<Option<FileHeader>> {
        if let Some(h) = inner.header {
            return Ok(Some(h));
        }
        let fd = inner.fd()?;
        let mut buf = [0u8; crate::contentenc::HEADER_LEN];
        let n = compat::pread_full(fd, &mut buf, 0)?;
        if n == 0 {
            return Ok(None);
        }
        // A 1..=17 byte backing file is a truncated header; unpack rejects it.
        let header = FileHeader::unpack(&buf[..n])?;
        inner.header = Some(header);
        Ok(Some(header))
    }

    /// Like [`get_header`](Self::get_header), but writes a fresh header if
    /// the file is still empty. The header goes to disk before any block.
    fn get_or_create_header(&self, inner: &mut Inner) -> Result<FileHeader> {
        if let Some(h) = self.get_header(inner)? {
            return Ok(h);
        }
        let header = FileHeader::random();
        compat::pwrite_full(inner.fd()?, &header.pack(), 0)?;
        inner.header = Some(header);
        Ok(header)
    }

    fn do_read(&self, inner: &mut Inner, off: u64, len: usize) -> Result<Vec<u8>> {
        let Some(header) = self.get_header(inner)? else {
            return Ok(Vec::new());
        };
        let fd = inner.fd()?;
        let range = ContentEnc::cipher_range(off, len as u64);
        let mut ciphertext = vec![0u8; range.length as usize];
        let n = compat::pread_full(fd, &mut ciphertext, range.offset)?;
        ciphertext.truncate(n);

        let first_block = ContentEnc::block_no_of_plain_off(off);
        let mut plaintext = self
            .enc
            .decrypt_blocks(&ciphertext, first_block, &header.file_id)
            .map_err(|e| {
                if let Error::BadBlock { block } = e {
                    warn!(ino = self.ino, block, "decryption failed, corrupt block");
                }
                e
            })?;

        // Crop to the requested window; the file may end before it.
        let skip = range.skip as usize;
        let out = if plaintext.len() > skip + len {
            plaintext[skip..skip + len].to_vec()
        } else if plaintext.len() > skip {
            plaintext[skip..].to_vec()
        } else {
            Vec::new()
        };
        plaintext.zeroize();
        Ok(out)
    }

    fn do_write(&self, inner: &mut Inner, data: &[u8], off: u64) -> Result<usize> {
        let header = self.get_or_create_header(inner)?;
        let eof = self.plain_size(inner)?;
        let mut written = 0usize;
        let mut cursor = 0usize;
        for span in ContentEnc::split_range(off, data.len() as u64) {
            let chunk = &data[cursor..cursor + span.length as usize];
            cursor += span.length as usize;

            // Partial blocks inside the file need a read-modify-write
            // cycle. A partial block starting at or past the end of file is
            // a fresh tail block; there is nothing to read back.
            let ciphertext = if span.is_partial() && span.plain_off() < eof {
                let mut old = self.do_read(inner, span.plain_off(), PLAIN_BS as usize)?;
                let mut merged = ContentEnc::merge_blocks(&old, chunk, span.skip as usize);
                old.zeroize();
                let ct = self.enc.encrypt_block(&merged, span.block_no, &header.file_id)?;
                merged.zeroize();
                ct
            } else if span.skip > 0 {
                let mut padded = ContentEnc::merge_blocks(&[], chunk, span.skip as usize);
                let ct = self.enc.encrypt_block(&padded, span.block_no, &header.file_id)?;
                padded.zeroize();
                ct
            } else {
                self.enc.encrypt_block(chunk, span.block_no, &header.file_id)?
            };

            let fd = inner.fd()?;
            compat::prealloc(fd, span.cipher_off(), ciphertext.len() as u64)?;
            if let Err(e) = compat::pwrite_full(fd, &ciphertext, span.cipher_off()) {
                // A prefix of the blocks may already be updated; there is no
                // transaction across blocks. Surface the error (ENOSPC and
                // friends) as-is.
                warn!(
                    ino = self.ino,
                    block = span.block_no,
                    "block write failed: {}",
                    e
                );
                return Err(e.into());
            }
            written += span.length as usize;
        }
        Ok(written)
    }

    /// Materialize zeros between `from` and `to`. Block-sized chunks go
    /// through the normal write path, so the last pre-existing block gets
    /// padded through read-modify-write and fresh blocks are authored with
    /// fresh nonces. Safe to repeat or resume after interruption.
    fn zero_pad(&self, inner: &mut Inner, from: u64, to: u64) -> Result<()> {
        let zeros = vec![0u8; PLAIN_BS as usize];
        let mut cur = from;
        while cur < to {
            let chunk = (PLAIN_BS - cur % PLAIN_BS).min(to - cur);
            self.do_write(inner, &zeros[..chunk as usize], cur)?;
            cur += chunk;
        }
        Ok(())
    }

    fn grow(&self, inner: &mut Inner, old_size: u64, new_size: u64) -> Result<()> {
        // A file extended purely via ftruncate still needs its header, or
        // the sparse blocks behind it are unreachable.
        self.get_or_create_header(inner)?;
        for span in ContentEnc::split_range(old_size, new_size - old_size) {
            if span.is_partial() {
                // Boundary block: pad with explicit zeros through RMW.
                let zeros = vec![0u8; span.length as usize];
                self.do_write(inner, &zeros, span.plain_off() + span.skip)?;
            } else {
                // Whole new block: extend the backing file instead. The
                // region reads back as all zeros, which decrypts to a
                // zero block.
                let fd = inner.fd()?;
                let end = (span.cipher_off() + CIPHER_BS) as libc::off_t;
                compat::retry_eintr(|| ftruncate(fd, end))?;
            }
        }
        Ok(())
    }

    fn shrink(&self, inner: &mut Inner, new_size: u64) -> Result<()> {
        let block_no = ContentEnc::block_no_of_plain_off(new_size);
        let plain_off = block_no * PLAIN_BS;
        let last_len = new_size - plain_off;
        if last_len > 0 {
            // The new last block shrinks: re-encrypt its remaining bytes
            // and write them back before cutting the file, so a crash in
            // between leaves a readable (just too long) file rather than a
            // shortened block that fails authentication.
            let header = self.get_or_create_header(inner)?;
            let mut keep = self.do_read(inner, plain_off, last_len as usize)?;
            let ciphertext = self.enc.encrypt_block(&keep, block_no, &header.file_id)?;
            keep.zeroize();
            let fd = inner.fd()?;
            compat::prealloc(fd, ContentEnc::cipher_off_of_block(block_no), ciphertext.len() as u64)?;
            compat::pwrite_full(fd, &ciphertext, ContentEnc::cipher_off_of_block(block_no))?;
        }
        let fd = inner.fd()?;
        let end = ContentEnc::cipher_size(new_size) as libc::off_t;
        compat::retry_eintr(|| ftruncate(fd, end))?;
        Ok(())
    }
}

fn to_timespec(t: Option<SystemTime>) -> TimeSpec {
    match t {
        Some(t) => {
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            TimeSpec::new(d.as_secs() as libc::time_t, d.subsec_nanos() as libc::c_long)
        }
        None => TimeSpec::new(0, libc::UTIME_OMIT as libc::c_long),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contentenc::HEADER_LEN;
    use crate::crypto::{random_array, AeadVariant, CryptoCore};
    use std::fs::{self, OpenOptions};
    use std::path::Path;
    use tempfile::TempDir;

    fn test_enc() -> Arc<ContentEnc> {
        let key = random_array();
        Arc::new(ContentEnc::new(
            CryptoCore::new(&key, AeadVariant::Gcm).unwrap(),
        ))
    }

    fn open_file(path: &Path, enc: &Arc<ContentEnc>) -> CryptFile {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap();
        CryptFile::new(OwnedFd::from(f), false, Arc::clone(enc)).unwrap()
    }

    fn backing_size(path: &Path) -> u64 {
        fs::metadata(path).unwrap().len()
    }

    #[test]
    fn test_empty_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        assert!(file.read(0, 0).unwrap().is_empty());
        assert!(file.read(0, 100).unwrap().is_empty());
        assert_eq!(backing_size(&path), 0);
    }

    #[test]
    fn test_small_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        assert_eq!(file.write(b"hello", 0).unwrap(), 5);
        // header + nonce + 5 + tag
        assert_eq!(backing_size(&path), 51);
        assert_eq!(file.read(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_two_full_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(&[0x41u8; 4096], 0).unwrap();
        file.write(&[0x42u8; 4096], 4096).unwrap();
        assert_eq!(backing_size(&path), 18 + 2 * 4124);

        let out = file.read(0, 8192).unwrap();
        assert_eq!(&out[..4096], &[0x41u8; 4096][..]);
        assert_eq!(&out[4096..], &[0x42u8; 4096][..]);
    }

    #[test]
    fn test_overwrite_single_byte_rmw() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(b"hello", 0).unwrap();
        let size_before = backing_size(&path);
        file.write(b"X", 2).unwrap();

        assert_eq!(file.read(0, 5).unwrap(), b"heXlo");
        assert_eq!(backing_size(&path), size_before);
    }

    #[test]
    fn test_shrink_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        file.write(&data, 0).unwrap();

        file.truncate(5000).unwrap();
        assert_eq!(file.read(0, 5000).unwrap(), &data[..5000]);
        assert!(file.read(5000, 100).unwrap().is_empty());
        // header + one full block + (nonce + tag + 904)
        assert_eq!(backing_size(&path), 5074);
    }

    #[test]
    fn test_write_past_eof_zero_pads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(b"Z", 10_000).unwrap();

        let head = file.read(0, 10_000).unwrap();
        assert_eq!(head, vec![0u8; 10_000]);
        assert_eq!(file.read(10_000, 10).unwrap(), b"Z");
        // header + two full blocks + partial block of 1809 bytes
        assert_eq!(backing_size(&path), 18 + 2 * 4124 + 28 + 1809);
    }

    #[test]
    fn test_grow_truncate_reads_zeros() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(b"hello", 0).unwrap();
        file.truncate(10_000).unwrap();

        let out = file.read(0, 10_000).unwrap();
        assert_eq!(&out[..5], b"hello");
        assert_eq!(&out[5..], &vec![0u8; 9995][..]);
        assert_eq!(backing_size(&path), ContentEnc::cipher_size(10_000));

        // Growing again to the same size changes nothing.
        file.truncate(10_000).unwrap();
        assert_eq!(backing_size(&path), ContentEnc::cipher_size(10_000));
    }

    #[test]
    fn test_grow_truncate_from_empty_full_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.truncate(2 * 4096).unwrap();
        assert_eq!(backing_size(&path), 18 + 2 * 4124);
        assert_eq!(file.read(0, 8192).unwrap(), vec![0u8; 8192]);
    }

    #[test]
    fn test_truncate_to_zero_resets_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(b"data", 0).unwrap();
        file.truncate(0).unwrap();
        assert_eq!(backing_size(&path), 0);
        assert!(file.read(0, 10).unwrap().is_empty());

        // Writable again with a fresh header.
        file.write(b"new", 0).unwrap();
        assert_eq!(file.read(0, 3).unwrap(), b"new");
    }

    #[test]
    fn test_read_straddling_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(&[7u8; 100], 0).unwrap();
        assert_eq!(file.read(50, 100).unwrap(), vec![7u8; 50]);
        assert!(file.read(100, 10).unwrap().is_empty());
        assert!(file.read(5000, 10).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_block_fails_only_overlapping_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(&vec![9u8; 3 * 4096], 0).unwrap();

        // Flip a byte inside block 1.
        let mut raw = fs::read(&path).unwrap();
        raw[HEADER_LEN + CIPHER_BS as usize + 200] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        assert_eq!(file.read(0, 4096).unwrap(), vec![9u8; 4096]);
        assert_eq!(file.read(2 * 4096, 4096).unwrap(), vec![9u8; 4096]);
        assert!(file.read(4096, 4096).is_err());
        assert!(file.read(0, 3 * 4096).is_err());
    }

    #[test]
    fn test_write_only_rejects_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let file = CryptFile::new(OwnedFd::from(f), true, test_enc()).unwrap();

        file.write(b"secret", 0).unwrap();
        assert!(matches!(file.read(0, 6), Err(Error::WriteOnly)));
    }

    #[test]
    fn test_release_fails_later_operations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(b"x", 0).unwrap();
        file.release();
        assert!(matches!(file.read(0, 1), Err(Error::Released)));
        assert!(matches!(file.write(b"y", 0), Err(Error::Released)));
        assert!(matches!(file.fsync(), Err(Error::Released)));
    }

    #[test]
    fn test_getattr_translates_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(&[1u8; 5000], 0).unwrap();
        let st = file.getattr().unwrap();
        assert_eq!(st.st_size, 5000);
        assert_eq!(backing_size(&path), ContentEnc::cipher_size(5000));
    }

    #[test]
    fn test_flush_and_fsync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        file.write(b"x", 0).unwrap();
        file.flush().unwrap();
        file.fsync().unwrap();
        // The descriptor survived the flush.
        assert_eq!(file.read(0, 1).unwrap(), b"x");
    }

    #[test]
    fn test_allocate_unsupported() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir.path().join("f"), &test_enc());
        assert!(matches!(file.allocate(0, 100), Err(Error::Unsupported)));
    }

    #[test]
    fn test_utimens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());
        file.write(b"x", 0).unwrap();

        let t = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        file.utimens(None, Some(t)).unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime, t);
    }

    #[test]
    fn test_zero_length_write_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        assert_eq!(file.write(b"", 0).unwrap(), 0);
        assert_eq!(backing_size(&path), 0);
    }

    #[test]
    fn test_write_roundtrip_random_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let file = open_file(&path, &test_enc());

        // Offsets chosen to hit block starts, interiors and boundaries.
        for (off, len) in [(0u64, 10usize), (4090, 20), (4096, 4096), (12000, 1), (8191, 2)] {
            let data: Vec<u8> = (0..len).map(|i| (i + off as usize) as u8).collect();
            file.write(&data, off).unwrap();
            assert_eq!(file.read(off, len).unwrap(), data, "off={} len={}", off, len);
        }
    }
}
