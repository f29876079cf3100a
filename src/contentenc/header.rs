//! Per-file header
//!
//! Every non-empty ciphertext file starts with a fixed 18-byte prefix:
//! a big-endian u16 format version followed by a 16-byte random file ID.
//! The file ID is mixed into the associated data of every block, binding
//! blocks to their file. A plaintext-empty file has a zero-byte backing
//! file and therefore no header; the header is written lazily on the first
//! write and never changes afterwards.

use crate::error::{Error, Result};

/// On-disk header length: 2-byte version + 16-byte file ID.
pub const HEADER_LEN: usize = 18;

/// Current header format version.
pub const HEADER_VERSION: u16 = 2;

/// Length of the per-file random ID.
pub const FILE_ID_LEN: usize = 16;

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    /// Fresh header with a random file ID.
    pub fn random() -> Self {
        FileHeader {
            file_id: crate::crypto::random_array(),
        }
    }

    /// Serialize to the on-disk layout.
    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        buf[2..].copy_from_slice(&self.file_id);
        buf
    }

    /// Parse the on-disk layout. A truncated header (a backing file of 1 to
    /// 17 bytes) means the file is corrupt, as does an unknown version.
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_LEN {
            return Err(Error::Corrupt(format!(
                "file header has {} bytes, want {}",
                buf.len(),
                HEADER_LEN
            )));
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported header version {}",
                version
            )));
        }
        let mut file_id = [0u8; FILE_ID_LEN];
        file_id.copy_from_slice(&buf[2..]);
        Ok(FileHeader { file_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let h = FileHeader::random();
        let packed = h.pack();
        assert_eq!(packed.len(), HEADER_LEN);
        assert_eq!(&packed[..2], &[0, 2]);
        assert_eq!(FileHeader::unpack(&packed).unwrap(), h);
    }

    #[test]
    fn test_unpack_rejects_short_header() {
        assert!(FileHeader::unpack(&[0u8; 17]).is_err());
        assert!(FileHeader::unpack(&[]).is_err());
    }

    #[test]
    fn test_unpack_rejects_unknown_version() {
        let mut buf = FileHeader::random().pack();
        buf[1] = 3;
        assert!(matches!(FileHeader::unpack(&buf), Err(Error::Corrupt(_))));
    }
}
