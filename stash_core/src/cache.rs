//! Content-addressable cache of file blobs parked outside the workspace.
//!
//! Files evicted from the workspace are renamed into the cache rather than
//! deleted, so a later sync that needs the same content can move them back
//! instead of fetching them again. Blobs live under a fixed three-level
//! shard hierarchy:
//!
//! ```text
//! cache_root/{n0}/{n1}/{n2}/{cache_id:016X}
//! ```
//!
//! where `n0..n2` are the top three nibbles of the 64-bit cache id. Cache
//! ids start from the leading eight bytes of the content digest and are
//! probed linearly on collision, so every live id is unique.

use crate::codec::{Decoder, Encoder};
use crate::content::FileContentId;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::stamp::{self, FileStamp};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Number of nibble levels in the shard hierarchy.
pub const SHARD_LEVELS: u32 = 3;

/// Total number of leaf shard directories (16^3).
pub const SHARD_COUNT: usize = 1 << (4 * SHARD_LEVELS);

/// One physically cached blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFileInfo {
    pub content_id: FileContentId,
    pub cache_id: u64,
    pub length: u64,
    pub last_modified: i64,
    pub read_only: bool,
    /// Batch number the blob was cached in. Purge evicts lowest first.
    pub sequence_number: u32,
}

impl CachedFileInfo {
    /// Metadata the blob is expected to have on disk.
    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            length: self.length,
            last_modified: self.last_modified,
            read_only: self.read_only,
        }
    }

    /// Location of the blob relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        shard_path(self.cache_id)
    }

    fn encode(&self, enc: &mut Encoder) {
        self.content_id.encode(enc);
        enc.write_u64(self.cache_id);
        enc.write_u64(self.length);
        enc.write_i64(self.last_modified);
        enc.write_bool(self.read_only);
        enc.write_u32(self.sequence_number);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            content_id: FileContentId::decode(dec)?,
            cache_id: dec.read_u64()?,
            length: dec.read_u64()?,
            last_modified: dec.read_i64()?,
            read_only: dec.read_bool()?,
            sequence_number: dec.read_u32()?,
        })
    }
}

/// Map a cache id to its path below the cache root.
pub fn shard_path(cache_id: u64) -> PathBuf {
    let mut path = PathBuf::new();
    for level in 0..SHARD_LEVELS {
        let nibble = (cache_id >> (60 - 4 * level)) & 0xf;
        path.push(format!("{:X}", nibble));
    }
    path.push(format!("{:016X}", cache_id));
    path
}

/// Statistics from a purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    /// Number of blobs evicted.
    pub files_removed: usize,
    /// Number of blobs still cached.
    pub files_remaining: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
    /// Total size of the cache afterwards.
    pub new_size: u64,
}

/// Tracks every blob in the cache directory.
#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    entries: HashMap<FileContentId, CachedFileInfo>,
    cache_ids: HashSet<u64>,
    next_sequence_number: u32,
}

impl ContentCache {
    /// Create an empty cache rooted at `root`. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: HashMap::new(),
            cache_ids: HashSet::new(),
            next_sequence_number: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the lengths of every cached blob.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.length).sum()
    }

    pub fn get(&self, content_id: &FileContentId) -> Option<&CachedFileInfo> {
        self.entries.get(content_id)
    }

    pub fn contains(&self, content_id: &FileContentId) -> bool {
        self.entries.contains_key(content_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CachedFileInfo> {
        self.entries.values()
    }

    /// Sequence number stamped on the next batch of inserted blobs.
    pub fn next_sequence_number(&self) -> u32 {
        self.next_sequence_number
    }

    /// Close the current batch. Blobs registered afterwards sort after it.
    pub fn advance_sequence(&mut self) {
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
    }

    /// Absolute path of a cached blob.
    pub fn path_of(&self, entry: &CachedFileInfo) -> PathBuf {
        self.root.join(entry.relative_path())
    }

    /// Create all shard directories.
    pub fn create_hierarchy(&self) -> Result<()> {
        (0..SHARD_COUNT).into_par_iter().try_for_each(|index| {
            let dir = self
                .root
                .join(format!("{:X}", (index >> 8) & 0xf))
                .join(format!("{:X}", (index >> 4) & 0xf))
                .join(format!("{:X}", index & 0xf));
            fs::create_dir_all(dir)
        })?;
        Ok(())
    }

    fn unique_cache_id(&self, digest: &Hash) -> u64 {
        let mut cache_id = digest.leading_u64();
        while self.cache_ids.contains(&cache_id) {
            cache_id = cache_id.wrapping_add(1);
        }
        cache_id
    }

    /// Start tracking a blob that is about to be moved into the cache.
    ///
    /// Assigns a unique cache id and stamps the entry with the current
    /// sequence number. The caller is responsible for placing the file at
    /// [`ContentCache::path_of`] with metadata matching `stamp`.
    pub fn register(&mut self, content_id: FileContentId, stamp: FileStamp) -> CachedFileInfo {
        if let Some(existing) = self.entries.get(&content_id) {
            return existing.clone();
        }

        let entry = CachedFileInfo {
            cache_id: self.unique_cache_id(content_id.digest()),
            content_id,
            length: stamp.length,
            last_modified: stamp.last_modified,
            read_only: stamp.read_only,
            sequence_number: self.next_sequence_number,
        };
        self.cache_ids.insert(entry.cache_id);
        self.entries.insert(entry.content_id.clone(), entry.clone());
        entry
    }

    /// Move `source` into the cache under `content_id`.
    pub fn insert(&mut self, content_id: FileContentId, source: &Path) -> Result<CachedFileInfo> {
        if self.contains(&content_id) {
            return Err(Error::integrity(
                source,
                format!("content {} is already cached", content_id),
            ));
        }

        let stamp = FileStamp::of(source)?
            .ok_or_else(|| Error::integrity(source, "source file does not exist"))?;
        let entry = self.register(content_id, stamp);
        let dest = self.path_of(&entry);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::rename(source, &dest) {
            self.take(&entry.content_id);
            return Err(e.into());
        }

        debug!(cache_id = entry.cache_id, "cached {}", source.display());
        Ok(entry)
    }

    /// Stop tracking a blob without touching the file. Used once the blob
    /// has been moved back into the workspace.
    pub fn take(&mut self, content_id: &FileContentId) -> Option<CachedFileInfo> {
        let entry = self.entries.remove(content_id)?;
        self.cache_ids.remove(&entry.cache_id);
        Some(entry)
    }

    /// Delete a blob from disk and stop tracking it.
    pub fn evict(&mut self, content_id: &FileContentId) -> Result<Option<CachedFileInfo>> {
        let Some(entry) = self.take(content_id) else {
            return Ok(None);
        };
        stamp::remove_file(&self.path_of(&entry))?;
        Ok(Some(entry))
    }

    /// True if the blob on disk still matches its recorded metadata.
    pub fn check_integrity(&self, entry: &CachedFileInfo) -> bool {
        match FileStamp::of(&self.path_of(entry)) {
            Ok(Some(stamp)) => stamp == entry.stamp(),
            _ => false,
        }
    }

    /// Recreate the shard hierarchy and evict every blob whose metadata no
    /// longer matches. Returns the number of evicted blobs.
    pub fn verify(&mut self) -> Result<usize> {
        self.create_hierarchy()?;

        let entries: Vec<&CachedFileInfo> = self.entries.values().collect();
        let invalid: Vec<FileContentId> = entries
            .par_iter()
            .filter(|entry| !self.check_integrity(entry))
            .map(|entry| entry.content_id.clone())
            .collect();

        for content_id in &invalid {
            warn!("cached content {} failed integrity check; evicting", content_id);
            self.evict(content_id)?;
        }
        Ok(invalid.len())
    }

    /// Evict the oldest blobs until the cache fits in `max_bytes`.
    pub fn purge(&mut self, max_bytes: u64) -> Result<PurgeStats> {
        let mut ordered: Vec<(u32, u64, FileContentId, u64)> = self
            .entries
            .values()
            .map(|entry| {
                (
                    entry.sequence_number,
                    entry.cache_id,
                    entry.content_id.clone(),
                    entry.length,
                )
            })
            .collect();
        ordered.sort_by_key(|(sequence, cache_id, ..)| (*sequence, *cache_id));

        let mut total = self.total_size();
        let mut stats = PurgeStats::default();
        for (_, _, content_id, length) in ordered {
            if total <= max_bytes {
                break;
            }
            self.evict(&content_id)?;
            total -= length;
            stats.files_removed += 1;
            stats.bytes_freed += length;
        }

        stats.files_remaining = self.len();
        stats.new_size = total;
        info!(
            "{} files removed, {} files remaining, new size {} bytes",
            stats.files_removed, stats.files_remaining, stats.new_size
        );
        Ok(stats)
    }

    /// Evict every blob for which `keep` returns false.
    pub fn retain(&mut self, keep: impl Fn(&FileContentId) -> bool) -> Result<usize> {
        let doomed: Vec<FileContentId> = self
            .entries
            .keys()
            .filter(|content_id| !keep(content_id))
            .cloned()
            .collect();
        for content_id in &doomed {
            self.evict(content_id)?;
        }
        Ok(doomed.len())
    }

    /// Write the sequence counter and every entry, ordered by cache id.
    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.write_u32(self.next_sequence_number);

        let mut entries: Vec<&CachedFileInfo> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.cache_id);
        enc.write_len(entries.len());
        for entry in entries {
            entry.encode(enc);
        }
    }

    pub(crate) fn decode(root: impl Into<PathBuf>, dec: &mut Decoder<'_>) -> Result<Self> {
        let mut cache = Self::new(root);
        cache.next_sequence_number = dec.read_u32()?;

        let count = dec.read_len()?;
        for _ in 0..count {
            let entry = CachedFileInfo::decode(dec)?;
            if !cache.cache_ids.insert(entry.cache_id) {
                return Err(Error::corrupted_state(format!(
                    "duplicate cache id {:016X}",
                    entry.cache_id
                )));
            }
            if cache
                .entries
                .insert(entry.content_id.clone(), entry)
                .is_some()
            {
                return Err(Error::corrupted_state("duplicate cached content id"));
            }
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn content(data: &[u8]) -> FileContentId {
        FileContentId::new(Hash::hash_bytes(data), "binary")
    }

    fn cache_file(cache: &mut ContentCache, dir: &Path, data: &[u8]) -> CachedFileInfo {
        let source = dir.join(format!("src-{}", Hash::hash_bytes(data)));
        fs::write(&source, data).unwrap();
        cache.insert(content(data), &source).unwrap()
    }

    #[test]
    fn test_shard_path_uses_top_nibbles() {
        let path = shard_path(0xABC1_2345_6789_0DEF);
        assert_eq!(path, PathBuf::from("A/B/C/ABC1234567890DEF"));
    }

    #[test]
    fn test_create_hierarchy() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path().join("Cache"));
        cache.create_hierarchy().unwrap();

        assert!(temp_dir.path().join("Cache/0/0/0").is_dir());
        assert!(temp_dir.path().join("Cache/F/F/F").is_dir());
        assert!(temp_dir.path().join("Cache/7/A/3").is_dir());
    }

    #[test]
    fn test_insert_moves_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        let source = temp_dir.path().join("a.bin");
        fs::write(&source, b"hello").unwrap();

        let entry = cache.insert(content(b"hello"), &source).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(cache.path_of(&entry)).unwrap(), b"hello");
        assert_eq!(entry.length, 5);
        assert_eq!(entry.cache_id, Hash::hash_bytes(b"hello").leading_u64());
        assert!(cache.check_integrity(&entry));
    }

    #[test]
    fn test_cache_id_collision_probes_linearly() {
        let mut cache = ContentCache::new("/unused");
        let digest = Hash::hash_bytes(b"same prefix");
        let stamp = FileStamp {
            length: 1,
            last_modified: 1,
            read_only: false,
        };

        let first = cache.register(FileContentId::new(digest, "text"), stamp);
        let second = cache.register(FileContentId::new(digest, "binary"), stamp);
        assert_eq!(second.cache_id, first.cache_id.wrapping_add(1));

        // Freed ids are reused.
        cache.take(&first.content_id);
        let third = cache.register(FileContentId::new(digest, "utf16"), stamp);
        assert_eq!(third.cache_id, first.cache_id);
    }

    #[test]
    fn test_integrity_detects_modification() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        let entry = cache_file(&mut cache, temp_dir.path(), b"original");

        fs::write(cache.path_of(&entry), b"tampered content").unwrap();
        assert!(!cache.check_integrity(&entry));

        fs::remove_file(cache.path_of(&entry)).unwrap();
        assert!(!cache.check_integrity(&entry));
    }

    #[test]
    fn test_verify_evicts_mismatches() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        let good = cache_file(&mut cache, temp_dir.path(), b"good");
        let bad = cache_file(&mut cache, temp_dir.path(), b"bad");
        fs::write(cache.path_of(&bad), b"worse!").unwrap();

        assert_eq!(cache.verify().unwrap(), 1);
        assert!(cache.contains(&good.content_id));
        assert!(!cache.contains(&bad.content_id));
        assert!(!cache.path_of(&bad).exists());
    }

    #[test]
    fn test_purge_to_zero() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        for size in [10usize, 20, 30] {
            cache_file(&mut cache, temp_dir.path(), &vec![size as u8; size]);
            cache.advance_sequence();
        }
        assert_eq!(cache.total_size(), 60);

        let stats = cache.purge(0).unwrap();
        assert_eq!(stats.files_removed, 3);
        assert_eq!(stats.files_remaining, 0);
        assert_eq!(stats.bytes_freed, 60);
        assert_eq!(stats.new_size, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_evicts_oldest_first_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        let oldest = cache_file(&mut cache, temp_dir.path(), &[1u8; 10]);
        cache.advance_sequence();
        let middle = cache_file(&mut cache, temp_dir.path(), &[2u8; 20]);
        cache.advance_sequence();
        let newest = cache_file(&mut cache, temp_dir.path(), &[3u8; 30]);

        // Dropping the oldest alone brings 60 down to 50.
        let stats = cache.purge(50).unwrap();
        assert_eq!(stats.files_removed, 1);
        assert_eq!(stats.new_size, 50);
        assert!(!cache.contains(&oldest.content_id));
        assert!(cache.contains(&middle.content_id));
        assert!(cache.contains(&newest.content_id));

        // Already within budget: nothing happens.
        let stats = cache.purge(50).unwrap();
        assert_eq!(stats.files_removed, 0);
    }

    #[test]
    fn test_retain() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        let keep = cache_file(&mut cache, temp_dir.path(), b"keep");
        let drop = cache_file(&mut cache, temp_dir.path(), b"drop");

        assert_eq!(cache.retain(|id| *id == keep.content_id).unwrap(), 1);
        assert!(cache.contains(&keep.content_id));
        assert!(!cache.path_of(&drop).exists());
    }

    #[test]
    fn test_encode_decode_preserves_entries() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ContentCache::new(temp_dir.path().join("Cache"));
        cache_file(&mut cache, temp_dir.path(), b"one");
        cache.advance_sequence();
        cache_file(&mut cache, temp_dir.path(), b"two");
        cache.advance_sequence();

        let mut enc = Encoder::new();
        cache.encode(&mut enc);
        let bytes = enc.finish();
        let decoded = ContentCache::decode(cache.root(), &mut Decoder::new(&bytes)).unwrap();

        assert_eq!(decoded.next_sequence_number(), 2);
        assert_eq!(decoded.len(), 2);
        for entry in cache.entries() {
            assert_eq!(decoded.get(&entry.content_id), Some(entry));
        }
    }

    #[test]
    fn test_purge_stats_json() {
        let stats = PurgeStats {
            files_removed: 1,
            files_remaining: 2,
            bytes_freed: 3,
            new_size: 4,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["files_removed"], 1);
        assert_eq!(json["new_size"], 4);
    }
}
