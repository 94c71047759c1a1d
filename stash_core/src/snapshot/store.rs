//! On-disk object store for snapshot nodes.
//!
//! Layout under the store root:
//! - `objects/{xx}/{rest}` for encoded tree nodes, addressed by hash
//! - `roots/{hash of name}` naming the root node of a stored snapshot
//! - `config` file with the store version

use super::tree::{StreamTree, StreamTreeRef};
use super::{MemorySnapshot, StreamSnapshot};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::{CompressionType, HEADER_SIZE, ObjectHeader, ObjectType};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Compression threshold: nodes >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// A hash-addressed store of encoded stream tree nodes.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Initialize a new store at the given path.
    pub fn init<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("roots"))?;
        fs::write(root.join("config"), "version=1\n")?;
        Ok(Self { root })
    }

    /// Open an existing store at the given path.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_repository(&root, "snapshot store config not found"));
        }
        Self::parse_config(&fs::read_to_string(&config_path)?)?;

        if !root.join("objects").is_dir() || !root.join("roots").is_dir() {
            return Err(Error::invalid_repository(
                &root,
                "snapshot store directory structure missing",
            ));
        }
        Ok(Self { root })
    }

    /// Open the store at `root`, creating it if needed.
    pub fn open_or_init<P: AsRef<Path>>(root: P) -> Result<Self> {
        if root.as_ref().join("config").exists() {
            Self::open(root)
        } else {
            Self::init(root)
        }
    }

    fn parse_config(content: &str) -> Result<()> {
        let version = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .find(|(key, _)| key.trim() == "version")
            .map(|(_, value)| value.trim());

        match version {
            Some("1") => Ok(()),
            other => Err(Error::invalid_config(format!(
                "Unsupported snapshot store version: {:?}",
                other
            ))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `objects/{first byte}/{remaining bytes}` under the store root.
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        let (dir, file) = hash.object_path_parts();
        self.root.join("objects").join(dir).join(file)
    }

    fn root_path(&self, name: &str) -> PathBuf {
        self.root
            .join("roots")
            .join(Hash::hash_bytes(name.as_bytes()).to_hex())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.object_path(hash).exists()
    }

    /// Write `path` atomically using tempfile.
    fn write_atomic(path: &Path, chunks: &[&[u8]]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::invalid_path(path.display().to_string(), "no parent"))?;
        fs::create_dir_all(dir)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        for chunk in chunks {
            temp_file.write_all(chunk)?;
        }
        temp_file.flush()?;
        temp_file.persist(path)?;
        Ok(())
    }

    /// Store an encoded node. Returns its hash.
    pub fn put_node(&self, payload: &[u8]) -> Result<Hash> {
        let hash = Hash::hash_bytes(payload);
        let obj_path = self.object_path(&hash);
        if obj_path.exists() {
            return Ok(hash);
        }

        let (stored, compression) = if payload.len() >= COMPRESSION_THRESHOLD {
            (compress_zstd(payload)?, CompressionType::Zstd)
        } else {
            (payload.to_vec(), CompressionType::None)
        };
        let header = ObjectHeader::new(ObjectType::TreeNode, compression, stored.len() as u64);

        Self::write_atomic(&obj_path, &[&header.encode(), &stored])?;
        Ok(hash)
    }

    /// Read an encoded node and verify it against its hash.
    pub fn get_node(&self, hash: &Hash) -> Result<Vec<u8>> {
        let obj_path = self.object_path(hash);
        let mut file = match fs::File::open(&obj_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(hash.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ObjectHeader::decode(&header_buf, &obj_path)?;

        let mut stored = Vec::new();
        file.read_to_end(&mut stored)?;
        if stored.len() as u64 != header.payload_len {
            return Err(Error::corrupted_object(
                &obj_path,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    header.payload_len,
                    stored.len()
                ),
            ));
        }

        let payload = match header.compression {
            CompressionType::None => stored,
            CompressionType::Zstd => decompress_zstd(&stored)?,
        };

        let computed = Hash::hash_bytes(&payload);
        if computed != *hash {
            return Err(Error::corrupted_object(
                &obj_path,
                format!("Hash mismatch: expected {}, got {}", hash, computed),
            ));
        }
        Ok(payload)
    }

    /// Copy every node of `snapshot` into the store and record its root
    /// under `name`. Returns the number of nodes that were not already
    /// present.
    pub fn import(&self, name: &str, snapshot: &MemorySnapshot) -> Result<usize> {
        let mut written = 0;
        for (hash, data) in snapshot.nodes() {
            if !self.contains(hash) {
                self.put_node(data)?;
                written += 1;
            }
        }
        self.put_root(name, snapshot.root(), snapshot.file_count())?;
        debug!("Stored snapshot {} ({} new nodes)", name, written);
        Ok(written)
    }

    /// Record the root of a named snapshot and the number of files under it.
    pub fn put_root(&self, name: &str, root: &StreamTreeRef, file_count: usize) -> Result<()> {
        let content = format!(
            "{}\n{}\n{}\n{}\n",
            name, root.hash, root.base_path, file_count
        );
        Self::write_atomic(&self.root_path(name), &[content.as_bytes()])
    }

    /// Look up the root of a named snapshot and its file count.
    pub fn get_root(&self, name: &str) -> Result<Option<(StreamTreeRef, usize)>> {
        let path = self.root_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = content.lines();
        let (Some(stored_name), Some(hash), Some(base_path), Some(file_count)) =
            (lines.next(), lines.next(), lines.next(), lines.next())
        else {
            return Err(Error::corrupted_object(&path, "truncated root record"));
        };
        if stored_name != name {
            return Err(Error::corrupted_object(
                &path,
                format!("root record names '{}', expected '{}'", stored_name, name),
            ));
        }

        let file_count = file_count
            .parse::<usize>()
            .map_err(|e| Error::corrupted_object(&path, format!("bad file count: {}", e)))?;

        Ok(Some((
            StreamTreeRef {
                base_path: base_path.to_string(),
                hash: Hash::from_hex(hash)?,
            },
            file_count,
        )))
    }
}

/// A snapshot whose nodes are read from a [`SnapshotStore`] on demand.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    store: Arc<SnapshotStore>,
    root: StreamTreeRef,
    file_count: usize,
}

impl StoredSnapshot {
    pub fn new(store: Arc<SnapshotStore>, root: StreamTreeRef, file_count: usize) -> Self {
        Self {
            store,
            root,
            file_count,
        }
    }

    /// Open the snapshot recorded under `name`, if any.
    pub fn open(store: Arc<SnapshotStore>, name: &str) -> Result<Option<Self>> {
        Ok(store
            .get_root(name)?
            .map(|(root, file_count)| Self::new(store, root, file_count)))
    }
}

impl StreamSnapshot for StoredSnapshot {
    fn root(&self) -> &StreamTreeRef {
        &self.root
    }

    fn lookup(&self, tree_ref: &StreamTreeRef) -> Result<StreamTree> {
        let data = self.store.get_node(&tree_ref.hash)?;
        StreamTree::decode(&tree_ref.base_path, &data)
    }

    fn file_count(&self) -> usize {
        self.file_count
    }
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3).map_err(|e| Error::Io {
        source: io::Error::other(format!("zstd compression failed: {}", e)),
    })
}

/// Decompress data using zstd.
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| Error::Io {
        source: io::Error::other(format!("zstd decompression failed: {}", e)),
    })
}
