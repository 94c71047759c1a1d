//! Content identity of a file, independent of its path or revision.

use crate::codec::{Decoder, Encoder};
use crate::error::Result;
use crate::hash::Hash;
use serde::Serialize;
use std::fmt;

/// Identifies file content by digest and file type.
///
/// Two files with equal content ids are interchangeable: bytes staged for
/// one may be copied or moved into place for the other. The type is part of
/// the key because the server may store the same bytes with different
/// filetype attributes (e.g. `text` vs `binary+w`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FileContentId {
    digest: Hash,
    file_type: String,
}

impl FileContentId {
    pub fn new(digest: Hash, file_type: impl Into<String>) -> Self {
        Self {
            digest,
            file_type: file_type.into(),
        }
    }

    pub fn digest(&self) -> &Hash {
        &self.digest
    }

    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.write_hash(&self.digest);
        enc.write_str(&self.file_type);
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let digest = dec.read_hash()?;
        let file_type = dec.read_str()?;
        Ok(Self { digest, file_type })
    }
}

impl fmt::Display for FileContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.digest, self.file_type)
    }
}
