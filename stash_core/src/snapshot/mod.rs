//! Immutable, hash-addressed listings of a stream at one change.
//!
//! A snapshot is a root [`StreamTreeRef`] plus a way to look up any node by
//! hash. Nodes can live in memory ([`MemorySnapshot`]) or in an on-disk
//! object store ([`StoredSnapshot`]).

mod builder;
mod store;
mod tree;

pub use builder::StreamTreeBuilder;
pub use store::{SnapshotStore, StoredSnapshot};
pub use tree::{StreamFile, StreamTree, StreamTreeRef};

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::hash::{HASH_SIZE, Hash};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Signature at the start of a snapshot cache file.
pub const CACHE_FILE_SIGNATURE: &[u8; 8] = b"STSNAP01";

/// Current snapshot cache file version.
pub const CACHE_FILE_VERSION: u32 = 2;

/// Read access to the nodes of one snapshot.
pub trait StreamSnapshot: Send + Sync {
    /// Reference to the root node.
    fn root(&self) -> &StreamTreeRef;

    /// Decode the node behind `tree_ref`.
    fn lookup(&self, tree_ref: &StreamTreeRef) -> Result<StreamTree>;

    /// Number of files under the root, known without walking the tree.
    fn file_count(&self) -> usize;
}

/// Iterate over every file in `snapshot` as `(client path, file)` pairs.
pub fn files(snapshot: &dyn StreamSnapshot) -> SnapshotFiles<'_> {
    SnapshotFiles::new(snapshot)
}

/// Lazy depth-first walk over the files of a snapshot.
///
/// Nodes are only looked up when the walk reaches them. Calling
/// [`files`] again starts a fresh walk.
pub struct SnapshotFiles<'a> {
    snapshot: &'a dyn StreamSnapshot,
    pending_trees: Vec<(String, StreamTreeRef)>,
    pending_files: VecDeque<(String, StreamFile)>,
    failed: bool,
}

impl<'a> SnapshotFiles<'a> {
    fn new(snapshot: &'a dyn StreamSnapshot) -> Self {
        Self {
            snapshot,
            pending_trees: vec![(String::new(), snapshot.root().clone())],
            pending_files: VecDeque::new(),
            failed: false,
        }
    }
}

impl Iterator for SnapshotFiles<'_> {
    type Item = Result<(String, StreamFile)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.pending_files.pop_front() {
                return Some(Ok(file));
            }
            if self.failed {
                return None;
            }

            let (prefix, tree_ref) = self.pending_trees.pop()?;
            let tree = match self.snapshot.lookup(&tree_ref) {
                Ok(tree) => tree,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            for (name, child) in tree.trees.into_iter().rev() {
                self.pending_trees.push((join(&prefix, &name), child));
            }
            self.pending_files.extend(
                tree.files
                    .into_iter()
                    .map(|(name, file)| (join(&prefix, &name), file)),
            );
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// A snapshot whose nodes are all held in memory.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    root: StreamTreeRef,
    nodes: HashMap<Hash, Vec<u8>>,
    file_count: usize,
}

impl MemorySnapshot {
    /// A snapshot containing no files.
    pub fn empty() -> Self {
        Self::from_builder(StreamTreeBuilder::new())
    }

    /// Freeze a builder into a snapshot.
    pub fn from_builder(builder: StreamTreeBuilder) -> Self {
        let file_count = builder.file_count();
        let mut nodes = HashMap::new();
        let root = builder.encode(&mut nodes);
        Self {
            root,
            nodes,
            file_count,
        }
    }

    /// Number of distinct nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Encoded nodes keyed by hash.
    pub fn nodes(&self) -> impl Iterator<Item = (&Hash, &[u8])> {
        self.nodes.iter().map(|(hash, data)| (hash, data.as_slice()))
    }

    /// Write the snapshot to a cache file.
    ///
    /// The file is written to a temporary file next to `path` and then
    /// moved into place. If another process has already written the same
    /// file, its copy is kept and ours is discarded.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut enc = Encoder::new();
        enc.write_raw(CACHE_FILE_SIGNATURE);
        enc.write_u32(CACHE_FILE_VERSION);
        enc.write_str(&self.root.base_path);
        enc.write_hash(&self.root.hash);
        enc.write_u64(self.file_count as u64);

        let mut nodes: Vec<(&Hash, &Vec<u8>)> = self.nodes.iter().collect();
        nodes.sort_by_key(|(hash, _)| **hash);
        enc.write_len(nodes.len());
        for (hash, data) in nodes {
            enc.write_hash(hash);
            enc.write_bytes(data);
        }

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        temp_file.write_all(&enc.finish())?;
        temp_file.flush()?;

        match temp_file.persist_noclobber(path) {
            Ok(_) => {
                info!("Saved snapshot cache to {}", path.display());
                Ok(())
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Snapshot cache {} was written concurrently", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a snapshot cache file.
    ///
    /// Returns `None` if the file does not exist or cannot be used; an
    /// unusable file is treated as a cache miss, not an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match Self::decode(&data) {
            Ok(snapshot) => {
                info!(
                    "Loaded snapshot cache from {} ({} nodes)",
                    path.display(),
                    snapshot.node_count()
                );
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!("Ignoring snapshot cache {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        if dec.read_raw(CACHE_FILE_SIGNATURE.len())? != CACHE_FILE_SIGNATURE {
            return Err(Error::corrupted_state("bad snapshot cache signature"));
        }
        let version = dec.read_u32()?;
        if version != CACHE_FILE_VERSION {
            return Err(Error::unsupported_version(
                "snapshot cache",
                i64::from(version),
            ));
        }

        let root = StreamTreeRef {
            base_path: dec.read_str()?,
            hash: dec.read_hash()?,
        };
        let file_count = usize::try_from(dec.read_u64()?)
            .map_err(|_| Error::corrupted_state("snapshot file count out of range"))?;

        // Each node is at least a hash and a length prefix.
        let count = dec.read_count(HASH_SIZE + 4)?;
        let mut nodes = HashMap::with_capacity(count);
        for _ in 0..count {
            let hash = dec.read_hash()?;
            let node = dec.read_bytes()?;
            if Hash::hash_bytes(node) != hash {
                return Err(Error::corrupted_state(format!(
                    "snapshot node {} does not match its hash",
                    hash
                )));
            }
            nodes.insert(hash, node.to_vec());
        }

        if !nodes.contains_key(&root.hash) {
            return Err(Error::object_not_found(root.hash.to_hex()));
        }
        Ok(Self {
            root,
            nodes,
            file_count,
        })
    }
}

impl StreamSnapshot for MemorySnapshot {
    fn root(&self) -> &StreamTreeRef {
        &self.root
    }

    fn lookup(&self, tree_ref: &StreamTreeRef) -> Result<StreamTree> {
        let data = self
            .nodes
            .get(&tree_ref.hash)
            .ok_or_else(|| Error::object_not_found(tree_ref.hash.to_hex()))?;
        StreamTree::decode(&tree_ref.base_path, data)
    }

    fn file_count(&self) -> usize {
        self.file_count
    }
}
