//! Binary framing for snapshot store objects.
//!
//! Every object file starts with a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "STSH" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   type: 1=tree node
//! 0x06  1   compression: 0=none, 1=zstd
//! 0x07  1   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored size
//! 0x10  ... payload
//! ```

use crate::error::{Error, Result};
use std::path::Path;

/// Magic bytes at the start of every object file.
pub const MAGIC: &[u8; 4] = b"STSH";

/// Current object format version.
pub const VERSION: u8 = 1;

/// Size of the object header in bytes.
pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// An encoded stream tree node.
    TreeNode = 1,
}

impl TryFrom<u8> for ObjectType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(ObjectType::TreeNode),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            other => Err(other),
        }
    }
}

/// A 16-byte object header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub object_type: ObjectType,
    pub compression: CompressionType,
    /// Length of the payload as stored (compressed size if compressed).
    pub payload_len: u64,
}

impl ObjectHeader {
    pub fn new(object_type: ObjectType, compression: CompressionType, payload_len: u64) -> Self {
        Self {
            object_type,
            compression,
            payload_len,
        }
    }

    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = self.object_type as u8;
        buf[6] = self.compression as u8;
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header read from the object file at `path`.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted_object(
                path,
                format!(
                    "Header too short: {} bytes (expected {})",
                    buf.len(),
                    HEADER_SIZE
                ),
            ));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::corrupted_object(
                path,
                format!("Invalid magic: {:?}", &buf[0..4]),
            ));
        }

        if buf[4] != VERSION {
            return Err(Error::unsupported_version("object", i64::from(buf[4])));
        }

        let object_type = ObjectType::try_from(buf[5])
            .map_err(|t| Error::corrupted_object(path, format!("unknown object type {}", t)))?;
        let compression = CompressionType::try_from(buf[6])
            .map_err(|c| Error::corrupted_object(path, format!("unknown compression {}", c)))?;

        if buf[7] != 0 {
            return Err(Error::corrupted_object(
                path,
                format!("Reserved byte must be 0, got {}", buf[7]),
            ));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..HEADER_SIZE]);
        Ok(Self::new(object_type, compression, u64::from_le_bytes(len_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ObjectHeader::new(ObjectType::TreeNode, CompressionType::Zstd, 0x0102);
        let buf = header.encode();

        assert_eq!(&buf[0..4], b"STSH");
        assert_eq!(buf[4], VERSION);
        assert_eq!(buf[5], 1);
        assert_eq!(buf[6], 1);
        assert_eq!(buf[7], 0);
        assert_eq!(&buf[8..10], &[0x02, 0x01]);

        assert_eq!(ObjectHeader::decode(&buf, Path::new("x")).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_garbage() {
        let path = Path::new("obj");
        let good = ObjectHeader::new(ObjectType::TreeNode, CompressionType::None, 4).encode();

        assert!(ObjectHeader::decode(&good[..8], path).is_err());

        let mut bad_magic = good;
        bad_magic[0] = b'X';
        assert!(ObjectHeader::decode(&bad_magic, path).is_err());

        let mut bad_version = good;
        bad_version[4] = 9;
        assert!(matches!(
            ObjectHeader::decode(&bad_version, path),
            Err(Error::UnsupportedVersion { .. })
        ));

        let mut bad_type = good;
        bad_type[5] = 7;
        assert!(ObjectHeader::decode(&bad_type, path).is_err());

        let mut bad_reserved = good;
        bad_reserved[7] = 1;
        assert!(ObjectHeader::decode(&bad_reserved, path).is_err());
    }
}
