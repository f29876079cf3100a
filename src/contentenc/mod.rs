//! Content encryption: the block pipeline
//!
//! File contents are stored as a sequence of authenticated blocks behind
//! the 18-byte file header. Each plaintext block of up to 4096 bytes
//! becomes `[12-byte nonce][ciphertext][16-byte tag]` = up to 4124 bytes,
//! with `u64 BE(block number) || file ID` as associated data. This module
//! owns the offset and size arithmetic between the two address spaces, the
//! read-modify-write planning for unaligned writes, and the encryption and
//! decryption of block sequences.

mod header;

pub use header::{FileHeader, FILE_ID_LEN, HEADER_LEN, HEADER_VERSION};

use crate::crypto::{random_array, CryptoCore, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use tracing::warn;

/// Plaintext block size.
pub const PLAIN_BS: u64 = 4096;

/// Per-block overhead: nonce plus tag.
pub const BLOCK_OVERHEAD: u64 = (NONCE_SIZE + TAG_SIZE) as u64;

/// Ciphertext block size.
pub const CIPHER_BS: u64 = PLAIN_BS + BLOCK_OVERHEAD;

/// The ciphertext byte range covering a plaintext request, aligned to whole
/// blocks. `skip` is the number of plaintext bytes to discard from the
/// first decrypted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherRange {
    pub offset: u64,
    pub length: u64,
    pub skip: u64,
}

/// One block's share of a plaintext write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Zero-based block number.
    pub block_no: u64,
    /// Offset of the first written byte within the block.
    pub skip: u64,
    /// Number of bytes written into this block.
    pub length: u64,
}

impl BlockSpan {
    /// Plaintext offset of the start of this block.
    pub fn plain_off(&self) -> u64 {
        self.block_no * PLAIN_BS
    }

    /// Ciphertext offset of the start of this block.
    pub fn cipher_off(&self) -> u64 {
        ContentEnc::cipher_off_of_block(self.block_no)
    }

    /// A partial block needs a read-modify-write cycle; a block that is
    /// overwritten from byte 0 to byte 4095 can be encrypted directly.
    /// Whether a partial block past the current end of file can skip the
    /// read is the caller's decision, since only the caller knows the size.
    pub fn is_partial(&self) -> bool {
        self.skip > 0 || self.length < PLAIN_BS
    }
}

/// Block-level encryption engine bound to the content key.
pub struct ContentEnc {
    core: CryptoCore,
}

impl ContentEnc {
    pub fn new(core: CryptoCore) -> Self {
        ContentEnc { core }
    }

    /// Block number containing the given plaintext offset.
    pub fn block_no_of_plain_off(off: u64) -> u64 {
        off / PLAIN_BS
    }

    /// Ciphertext offset where the given block starts.
    pub fn cipher_off_of_block(block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * CIPHER_BS
    }

    /// Compute the ciphertext range covering the plaintext request
    /// `(off, len)`. The range always spans whole blocks.
    pub fn cipher_range(off: u64, len: u64) -> CipherRange {
        if len == 0 {
            return CipherRange {
                offset: Self::cipher_off_of_block(off / PLAIN_BS),
                length: 0,
                skip: off % PLAIN_BS,
            };
        }
        let first = off / PLAIN_BS;
        let last = (off + len - 1) / PLAIN_BS;
        CipherRange {
            offset: Self::cipher_off_of_block(first),
            length: (last - first + 1) * CIPHER_BS,
            skip: off - first * PLAIN_BS,
        }
    }

    /// Plan a plaintext write `(off, len)` as an ordered list of per-block
    /// spans.
    pub fn split_range(mut off: u64, mut len: u64) -> Vec<BlockSpan> {
        let mut spans = Vec::new();
        while len > 0 {
            let block_no = off / PLAIN_BS;
            let skip = off - block_no * PLAIN_BS;
            let length = (PLAIN_BS - skip).min(len);
            spans.push(BlockSpan {
                block_no,
                skip,
                length,
            });
            off += length;
            len -= length;
        }
        spans
    }

    /// Translate a ciphertext file size to the plaintext size it encodes.
    pub fn plain_size(cipher_size: u64) -> Result<u64> {
        if cipher_size == 0 {
            return Ok(0);
        }
        if cipher_size < HEADER_LEN as u64 {
            return Err(Error::Corrupt(format!(
                "backing file of {} bytes has a truncated header",
                cipher_size
            )));
        }
        // A header-only file encodes zero blocks and reads as empty.
        let payload = cipher_size - HEADER_LEN as u64;
        let full = payload / CIPHER_BS;
        let rest = payload % CIPHER_BS;
        if rest == 0 {
            return Ok(full * PLAIN_BS);
        }
        if rest <= BLOCK_OVERHEAD {
            // A block must carry at least one plaintext byte.
            return Err(Error::Corrupt(format!(
                "last block has {} bytes, not enough for nonce and tag plus payload",
                rest
            )));
        }
        Ok(full * PLAIN_BS + (rest - BLOCK_OVERHEAD))
    }

    /// Inverse of [`plain_size`](Self::plain_size).
    pub fn cipher_size(plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let full = plain_size / PLAIN_BS;
        let rest = plain_size % PLAIN_BS;
        let mut size = HEADER_LEN as u64 + full * CIPHER_BS;
        if rest > 0 {
            size += BLOCK_OVERHEAD + rest;
        }
        size
    }

    /// Reject a write that would leave an unwritten gap between the current
    /// end of file and the write offset. The file layer reacts by zero-padding
    /// up to `off` first; the encrypted format has no encoding for an
    /// unwritten interior block.
    pub fn check_no_hole(plain_size: u64, off: u64) -> Result<()> {
        if off > plain_size {
            return Err(Error::HolePunch {
                offset: off,
                size: plain_size,
            });
        }
        Ok(())
    }

    /// Merge `new` into `old` at offset `skip`, zero-filling any gap. Used
    /// for the modify step of read-modify-write.
    pub fn merge_blocks(old: &[u8], new: &[u8], skip: usize) -> Vec<u8> {
        let len = old.len().max(skip + new.len());
        let mut out = vec![0u8; len];
        out[..old.len()].copy_from_slice(old);
        out[skip..skip + new.len()].copy_from_slice(new);
        out
    }

    /// Encrypt one plaintext block. Empty input encrypts to an empty block.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> Result<Vec<u8>> {
        debug_assert!(plaintext.len() as u64 <= PLAIN_BS);
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        let nonce = random_array::<NONCE_SIZE>();
        let ad = block_ad(block_no, file_id);
        let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len() + TAG_SIZE);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&self.core.encrypt(&nonce, &ad, plaintext)?);
        Ok(out)
    }

    /// Encrypt a contiguous plaintext buffer starting at block
    /// `first_block`, one fresh nonce per block.
    pub fn encrypt_blocks(
        &self,
        plaintext: &[u8],
        first_block: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            plaintext.len() + (plaintext.len() / PLAIN_BS as usize + 1) * BLOCK_OVERHEAD as usize,
        );
        for (i, chunk) in plaintext.chunks(PLAIN_BS as usize).enumerate() {
            out.extend_from_slice(&self.encrypt_block(chunk, first_block + i as u64, file_id)?);
        }
        Ok(out)
    }

    /// Decrypt a sequence of ciphertext blocks starting at block
    /// `first_block`. Stops at the first block that fails authentication
    /// and returns no plaintext at all in that case.
    ///
    /// A trailing zero-length block decrypts to empty plaintext. A full
    /// block of all zero bytes is a region created by `ftruncate` and
    /// decrypts to all-zero plaintext.
    pub fn decrypt_blocks(
        &self,
        ciphertext: &[u8],
        first_block: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(
            (ciphertext.len() / CIPHER_BS as usize + 1) * PLAIN_BS as usize,
        );
        for (i, chunk) in ciphertext.chunks(CIPHER_BS as usize).enumerate() {
            let block_no = first_block + i as u64;
            out.extend_from_slice(&self.decrypt_block(chunk, block_no, file_id)?);
        }
        Ok(out)
    }

    fn decrypt_block(&self, chunk: &[u8], block_no: u64, file_id: &[u8; FILE_ID_LEN]) -> Result<Vec<u8>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        if chunk.len() as u64 <= BLOCK_OVERHEAD {
            warn!(block_no, len = chunk.len(), "block too short to hold nonce and tag");
            return Err(Error::Corrupt(format!(
                "block {} is only {} bytes",
                block_no,
                chunk.len()
            )));
        }
        // ftruncate-grown sparse regions read back as all zeros.
        if chunk.iter().all(|&b| b == 0) {
            return Ok(vec![0u8; chunk.len() - BLOCK_OVERHEAD as usize]);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&chunk[..NONCE_SIZE]);
        let ad = block_ad(block_no, file_id);
        self.core
            .decrypt(&nonce, &ad, &chunk[NONCE_SIZE..])
            .map_err(|e| match e {
                Error::AuthFailed => Error::BadBlock { block: block_no },
                other => other,
            })
    }
}

/// Associated data binding a block to its number and file.
fn block_ad(block_no: u64, file_id: &[u8; FILE_ID_LEN]) -> [u8; 8 + FILE_ID_LEN] {
    let mut ad = [0u8; 8 + FILE_ID_LEN];
    ad[..8].copy_from_slice(&block_no.to_be_bytes());
    ad[8..].copy_from_slice(file_id);
    ad
}
