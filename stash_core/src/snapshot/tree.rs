//! Immutable stream tree nodes and their canonical encoding.
//!
//! A node is encoded relative to its base path, the depot directory most of
//! its children live under. A child whose depot path is exactly
//! `base_path/name` is written without a path; only deviating children carry
//! an explicit one. The base path itself is stored in the parent's
//! [`StreamTreeRef`], so an unchanged directory encodes, and therefore
//! hashes, identically in every snapshot that contains it.
//!
//! Node layout:
//!
//! ```text
//! file_count: i32
//! per file (sorted by name):
//!   name: str
//!   has_path: bool, [path: str]
//!   length: u64
//!   content_id: digest (32 bytes) + type: str
//!   revision: i32
//! tree_count: i32
//! per subtree (sorted by name):
//!   name: str
//!   has_path: bool, [path: str]
//!   hash: 32 bytes
//! ```

use crate::codec::{Decoder, Encoder};
use crate::content::FileContentId;
use crate::error::{Error, Result};
use crate::hash::Hash;
use std::collections::BTreeMap;

/// One remote file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFile {
    /// Depot path of the file.
    pub path: String,
    pub length: u64,
    pub content_id: FileContentId,
    pub revision: i32,
}

/// Reference to a frozen subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTreeRef {
    /// Depot path that children of the referenced node are relative to.
    pub base_path: String,
    pub hash: Hash,
}

/// A frozen directory node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamTree {
    pub base_path: String,
    pub files: BTreeMap<String, StreamFile>,
    pub trees: BTreeMap<String, StreamTreeRef>,
}

/// Depot path a child named `name` is assumed to have under `base_path`.
pub(crate) fn default_path(base_path: &str, name: &str) -> String {
    format!("{}/{}", base_path, name)
}

/// The parent directory of `path`, if `path` ends with `/name`.
pub(crate) fn parent_for(path: &str, name: &str) -> Option<String> {
    path.strip_suffix(name)
        .and_then(|prefix| prefix.strip_suffix('/'))
        .map(str::to_string)
}

fn write_optional_path(enc: &mut Encoder, base_path: &str, name: &str, path: &str) {
    if parent_for(path, name).as_deref() == Some(base_path) {
        enc.write_bool(false);
    } else {
        enc.write_bool(true);
        enc.write_str(path);
    }
}

fn read_optional_path(dec: &mut Decoder<'_>, base_path: &str, name: &str) -> Result<String> {
    if dec.read_bool()? {
        dec.read_str()
    } else {
        Ok(default_path(base_path, name))
    }
}

impl StreamTree {
    /// Create an empty node.
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            files: BTreeMap::new(),
            trees: BTreeMap::new(),
        }
    }

    /// Canonical encoding of this node relative to its base path.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();

        enc.write_len(self.files.len());
        for (name, file) in &self.files {
            enc.write_str(name);
            write_optional_path(&mut enc, &self.base_path, name, &file.path);
            enc.write_u64(file.length);
            file.content_id.encode(&mut enc);
            enc.write_i32(file.revision);
        }

        enc.write_len(self.trees.len());
        for (name, tree_ref) in &self.trees {
            enc.write_str(name);
            write_optional_path(&mut enc, &self.base_path, name, &tree_ref.base_path);
            enc.write_hash(&tree_ref.hash);
        }

        enc.finish()
    }

    /// Hash of the canonical encoding.
    pub fn hash(&self) -> Hash {
        Hash::hash_bytes(&self.encode())
    }

    /// Decode a node, resolving implicit paths against `base_path`.
    pub fn decode(base_path: &str, data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let mut tree = StreamTree::new(base_path);

        let file_count = dec.read_len()?;
        for _ in 0..file_count {
            let name = dec.read_str()?;
            let path = read_optional_path(&mut dec, base_path, &name)?;
            let length = dec.read_u64()?;
            let content_id = FileContentId::decode(&mut dec)?;
            let revision = dec.read_i32()?;
            tree.files.insert(
                name,
                StreamFile {
                    path,
                    length,
                    content_id,
                    revision,
                },
            );
        }

        let tree_count = dec.read_len()?;
        for _ in 0..tree_count {
            let name = dec.read_str()?;
            let path = read_optional_path(&mut dec, base_path, &name)?;
            let hash = dec.read_hash()?;
            tree.trees.insert(
                name,
                StreamTreeRef {
                    base_path: path,
                    hash,
                },
            );
        }

        if !dec.is_empty() {
            return Err(Error::corrupted_state(format!(
                "trailing bytes after stream tree node at offset {}",
                dec.position()
            )));
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, data: &[u8]) -> StreamFile {
        StreamFile {
            path: path.to_string(),
            length: data.len() as u64,
            content_id: FileContentId::new(Hash::hash_bytes(data), "binary"),
            revision: 3,
        }
    }

    fn sample(base: &str) -> StreamTree {
        let mut tree = StreamTree::new(base);
        tree.files
            .insert("a.txt".into(), file(&format!("{}/a.txt", base), b"a"));
        tree.files
            .insert("b.txt".into(), file(&format!("{}/b.txt", base), b"b"));
        tree.trees.insert(
            "Sub".into(),
            StreamTreeRef {
                base_path: format!("{}/Sub", base),
                hash: Hash::hash_bytes(b"sub"),
            },
        );
        tree
    }

    #[test]
    fn test_parent_for() {
        assert_eq!(parent_for("//main/a/b.txt", "b.txt").as_deref(), Some("//main/a"));
        assert_eq!(parent_for("//main/a/xb.txt", "b.txt"), None);
        assert_eq!(parent_for("b.txt", "b.txt"), None);
    }

    #[test]
    fn test_encode_decode() {
        let tree = sample("//main/Engine");
        let decoded = StreamTree::decode("//main/Engine", &tree.encode()).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_hash_independent_of_base_path() {
        let main = sample("//main/Engine");
        let dev = sample("//dev/Engine");
        assert_eq!(main.hash(), dev.hash());

        // Decoding under the other base path yields the other tree.
        let decoded = StreamTree::decode("//dev/Engine", &main.encode()).unwrap();
        assert_eq!(decoded, dev);
    }

    #[test]
    fn test_deviating_path_is_explicit() {
        let mut tree = sample("//main/Engine");
        tree.files
            .insert("moved.txt".into(), file("//main/Other/moved.txt", b"m"));

        let decoded = StreamTree::decode("//main/Engine", &tree.encode()).unwrap();
        assert_eq!(decoded.files["moved.txt"].path, "//main/Other/moved.txt");

        // The explicit path now pins the hash to this stream.
        let mut dev = sample("//dev/Engine");
        dev.files
            .insert("moved.txt".into(), file("//dev/Other/moved.txt", b"m"));
        assert_ne!(tree.hash(), dev.hash());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = sample("//main").encode();
        bytes.push(0);
        assert!(StreamTree::decode("//main", &bytes).is_err());
    }
}
