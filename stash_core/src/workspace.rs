//! Mutable mirror of the files staged in the workspace directory.
//!
//! Every tracked file records the metadata it had when it was staged. A file
//! whose on-disk metadata no longer matches has been changed behind our back
//! and can no longer be trusted to hold its recorded content.

use crate::codec::{Decoder, Encoder};
use crate::content::FileContentId;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::stamp::FileStamp;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFile {
    pub name: String,
    pub length: u64,
    /// Modification time in nanoseconds since the Unix epoch. Zero for a
    /// file that has been planned but not yet written.
    pub last_modified: i64,
    pub read_only: bool,
    pub content_id: FileContentId,
}

impl WorkspaceFile {
    pub fn new(name: impl Into<String>, stamp: FileStamp, content_id: FileContentId) -> Self {
        Self {
            name: name.into(),
            length: stamp.length,
            last_modified: stamp.last_modified,
            read_only: stamp.read_only,
            content_id,
        }
    }

    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            length: self.length,
            last_modified: self.last_modified,
            read_only: self.read_only,
        }
    }

    pub fn set_stamp(&mut self, stamp: FileStamp) {
        self.length = stamp.length;
        self.last_modified = stamp.last_modified;
        self.read_only = stamp.read_only;
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.write_str(&self.name);
        enc.write_u64(self.length);
        enc.write_i64(self.last_modified);
        enc.write_bool(self.read_only);
        self.content_id.encode(enc);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            name: dec.read_str()?,
            length: dec.read_u64()?,
            last_modified: dec.read_i64()?,
            read_only: dec.read_bool()?,
            content_id: FileContentId::decode(dec)?,
        })
    }
}

/// A tracked directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkspaceDirectory {
    pub name: String,
    pub files: BTreeMap<String, WorkspaceFile>,
    pub directories: BTreeMap<String, WorkspaceDirectory>,
    /// Hash of the stream tree this directory was last fully reconciled
    /// with. Cleared whenever anything below it changes.
    pub stream_hash: Option<Hash>,
}

/// Paths scheduled for deletion by [`WorkspaceDirectory::refresh`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshResult {
    pub files_to_delete: Vec<PathBuf>,
    pub directories_to_delete: Vec<PathBuf>,
}

impl RefreshResult {
    fn merge(&mut self, other: RefreshResult) {
        self.files_to_delete.extend(other.files_to_delete);
        self.directories_to_delete
            .extend(other.directories_to_delete);
    }
}

/// Split a `/`-separated relative path into its components.
fn components(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts
        .iter()
        .any(|part| part.is_empty() || *part == "." || *part == "..")
    {
        return Err(Error::invalid_path(path, "not a normalized relative path"));
    }
    Ok(parts)
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

impl WorkspaceDirectory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    /// Track a file at `path`, creating intermediate directories.
    pub fn add_file(
        &mut self,
        path: &str,
        stamp: FileStamp,
        content_id: FileContentId,
    ) -> Result<()> {
        let parts = components(path)?;
        let (name, dirs) = parts
            .split_last()
            .ok_or_else(|| Error::invalid_path(path, "empty path"))?;

        let mut dir = self;
        dir.stream_hash = None;
        for part in dirs {
            dir = dir
                .directories
                .entry(part.to_string())
                .or_insert_with(|| WorkspaceDirectory::new(*part));
            dir.stream_hash = None;
        }
        dir.files
            .insert(name.to_string(), WorkspaceFile::new(*name, stamp, content_id));
        Ok(())
    }

    pub fn find_directory(&self, path: &str) -> Option<&WorkspaceDirectory> {
        if path.is_empty() {
            return Some(self);
        }
        let mut dir = self;
        for part in path.split('/') {
            dir = dir.directories.get(part)?;
        }
        Some(dir)
    }

    pub(crate) fn find_directory_mut(&mut self, path: &str) -> Option<&mut WorkspaceDirectory> {
        if path.is_empty() {
            return Some(self);
        }
        let mut dir = self;
        for part in path.split('/') {
            dir = dir.directories.get_mut(part)?;
        }
        Some(dir)
    }

    pub fn find_file(&self, path: &str) -> Option<&WorkspaceFile> {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (self.find_directory(dir)?, name),
            None => (self, path),
        };
        dir.files.get(name)
    }

    /// Record fresh on-disk metadata for a tracked file. Returns false if
    /// the file is not tracked.
    pub fn update_stamp(&mut self, path: &str, stamp: FileStamp) -> bool {
        let (dir_path, name) = path.rsplit_once('/').unwrap_or(("", path));
        match self
            .find_directory_mut(dir_path)
            .and_then(|dir| dir.files.get_mut(name))
        {
            Some(file) => {
                file.set_stamp(stamp);
                true
            }
            None => false,
        }
    }

    /// Re-read the metadata of the tracked file at `path` below `root`.
    /// Returns false if the file is not tracked or not on disk.
    pub fn update_metadata(&mut self, root: &Path, path: &str) -> Result<bool> {
        match FileStamp::of(&root.join(path))? {
            Some(stamp) => Ok(self.update_stamp(path, stamp)),
            None => Ok(false),
        }
    }

    /// Every tracked file with its `/`-separated path.
    pub fn files(&self) -> Vec<(String, &WorkspaceFile)> {
        let mut result = Vec::new();
        let mut stack: Vec<(String, &WorkspaceDirectory)> = vec![(String::new(), self)];
        while let Some((prefix, dir)) = stack.pop() {
            for (name, file) in &dir.files {
                result.push((join(&prefix, name), file));
            }
            for (name, child) in &dir.directories {
                stack.push((join(&prefix, name), child));
            }
        }
        result
    }

    /// Every directory below this one (not including it) with its path.
    pub fn directory_paths(&self) -> Vec<String> {
        let mut result = Vec::new();
        let mut stack: Vec<(String, &WorkspaceDirectory)> = vec![(String::new(), self)];
        while let Some((prefix, dir)) = stack.pop() {
            for (name, child) in &dir.directories {
                let path = join(&prefix, name);
                result.push(path.clone());
                stack.push((path, child));
            }
        }
        result
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
            + self
                .directories
                .values()
                .map(WorkspaceDirectory::file_count)
                .sum::<usize>()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|file| file.length).sum::<u64>()
            + self
                .directories
                .values()
                .map(WorkspaceDirectory::total_size)
                .sum::<u64>()
    }

    /// Compare the tree with the directory at `dir` on disk.
    ///
    /// Tracked files that are missing are dropped. Tracked files whose
    /// metadata changed are dropped and scheduled for deletion. Untracked
    /// files and directories are scheduled for deletion only if
    /// `remove_untracked` is set. Subdirectories are scanned in parallel.
    pub fn refresh(&mut self, dir: &Path, remove_untracked: bool) -> Result<RefreshResult> {
        self.refresh_inner(dir, remove_untracked).map(|(result, _)| result)
    }

    fn refresh_inner(&mut self, dir: &Path, remove_untracked: bool) -> Result<(RefreshResult, bool)> {
        let mut result = RefreshResult::default();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let changed = !self.is_empty();
                self.files.clear();
                self.directories.clear();
                if changed {
                    self.stream_hash = None;
                }
                return Ok((result, changed));
            }
            Err(e) => return Err(e.into()),
        };

        let mut disk_files: BTreeMap<String, FileStamp> = BTreeMap::new();
        let mut disk_dirs: BTreeSet<String> = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                disk_dirs.insert(name);
            } else {
                disk_files.insert(name, FileStamp::from_metadata(&metadata));
            }
        }

        let mut changed = false;

        self.files.retain(|name, file| match disk_files.remove(name) {
            Some(stamp) if stamp == file.stamp() => true,
            Some(_) => {
                result.files_to_delete.push(dir.join(name));
                changed = true;
                false
            }
            None => {
                changed = true;
                false
            }
        });
        if remove_untracked {
            result
                .files_to_delete
                .extend(disk_files.keys().map(|name| dir.join(name)));
        }

        self.directories.retain(|name, _| {
            let exists = disk_dirs.remove(name);
            changed |= !exists;
            exists
        });
        if remove_untracked {
            result
                .directories_to_delete
                .extend(disk_dirs.iter().map(|name| dir.join(name)));
        }

        let children: Vec<(RefreshResult, bool)> = self
            .directories
            .par_iter_mut()
            .map(|(name, child)| child.refresh_inner(&dir.join(name), remove_untracked))
            .collect::<Result<_>>()?;
        for (child_result, child_changed) in children {
            result.merge(child_result);
            changed |= child_changed;
        }

        if changed {
            self.stream_hash = None;
        }
        Ok((result, changed))
    }

    /// List differences between the tree and the directory at `dir`:
    /// `+path` for untracked files on disk, `-path` for tracked files that
    /// are missing, and `!path` for tracked files whose metadata changed.
    pub fn find_differences(&self, dir: &Path) -> Result<Vec<String>> {
        let mut differences = self.differences_inner(dir, "")?;
        differences.sort();
        Ok(differences)
    }

    fn differences_inner(&self, dir: &Path, prefix: &str) -> Result<Vec<String>> {
        let mut differences = Vec::new();

        let mut disk_files: BTreeMap<String, FileStamp> = BTreeMap::new();
        let mut disk_dirs: BTreeSet<String> = BTreeSet::new();
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let metadata = entry.metadata()?;
                    if metadata.is_dir() {
                        disk_dirs.insert(name);
                    } else {
                        disk_files.insert(name, FileStamp::from_metadata(&metadata));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for (name, file) in &self.files {
            match disk_files.remove(name) {
                Some(stamp) if stamp == file.stamp() => {}
                Some(_) => differences.push(format!("!{}", join(prefix, name))),
                None => differences.push(format!("-{}", join(prefix, name))),
            }
        }
        for name in disk_files.keys() {
            differences.push(format!("+{}", join(prefix, name)));
        }
        for name in &disk_dirs {
            if !self.directories.contains_key(name) {
                differences.push(format!("+{}/", join(prefix, name)));
            }
        }

        let children: Vec<Vec<String>> = self
            .directories
            .par_iter()
            .map(|(name, child)| child.differences_inner(&dir.join(name), &join(prefix, name)))
            .collect::<Result<_>>()?;
        differences.extend(children.into_iter().flatten());
        Ok(differences)
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) {
        match &self.stream_hash {
            Some(hash) => {
                enc.write_bool(true);
                enc.write_hash(hash);
            }
            None => enc.write_bool(false),
        }

        enc.write_len(self.files.len());
        for file in self.files.values() {
            file.encode(enc);
        }

        enc.write_len(self.directories.len());
        for (name, dir) in &self.directories {
            enc.write_str(name);
            dir.encode(enc);
        }
    }

    pub(crate) fn decode(name: &str, dec: &mut Decoder<'_>) -> Result<Self> {
        let mut dir = WorkspaceDirectory::new(name);
        if dec.read_bool()? {
            dir.stream_hash = Some(dec.read_hash()?);
        }

        let file_count = dec.read_len()?;
        for _ in 0..file_count {
            let file = WorkspaceFile::decode(dec)?;
            dir.files.insert(file.name.clone(), file);
        }

        let dir_count = dec.read_len()?;
        for _ in 0..dir_count {
            let child_name = dec.read_str()?;
            let child = WorkspaceDirectory::decode(&child_name, dec)?;
            dir.directories.insert(child_name, child);
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn content(data: &[u8]) -> FileContentId {
        FileContentId::new(Hash::hash_bytes(data), "binary")
    }

    /// Write a file under `root` and track it with its real metadata.
    fn stage(workspace: &mut WorkspaceDirectory, root: &Path, path: &str, data: &[u8]) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, data).unwrap();
        let stamp = FileStamp::of(&full).unwrap().unwrap();
        workspace.add_file(path, stamp, content(data)).unwrap();
    }

    #[test]
    fn test_add_and_find() {
        let mut workspace = WorkspaceDirectory::default();
        let stamp = FileStamp {
            length: 3,
            last_modified: 1,
            read_only: true,
        };
        workspace
            .add_file("Engine/Source/main.cpp", stamp, content(b"abc"))
            .unwrap();
        workspace.add_file("top.txt", stamp, content(b"t")).unwrap();

        let file = workspace.find_file("Engine/Source/main.cpp").unwrap();
        assert_eq!(file.name, "main.cpp");
        assert!(file.read_only);
        assert!(workspace.find_file("Engine/missing.cpp").is_none());
        assert_eq!(workspace.file_count(), 2);
        assert_eq!(workspace.total_size(), 6);

        let mut dirs = workspace.directory_paths();
        dirs.sort();
        assert_eq!(dirs, vec!["Engine", "Engine/Source"]);

        assert!(workspace.add_file("a/../b", stamp, content(b"")).is_err());
    }

    #[test]
    fn test_add_file_clears_stream_hash_on_path() {
        let mut workspace = WorkspaceDirectory::default();
        let stamp = FileStamp {
            length: 1,
            last_modified: 1,
            read_only: false,
        };
        workspace.add_file("a/b/c", stamp, content(b"c")).unwrap();
        workspace.add_file("x/y", stamp, content(b"y")).unwrap();
        let hash = Some(Hash::hash_bytes(b"tree"));
        workspace.stream_hash = hash;
        workspace.directories.get_mut("a").unwrap().stream_hash = hash;
        workspace.directories.get_mut("x").unwrap().stream_hash = hash;

        workspace.add_file("a/new", stamp, content(b"n")).unwrap();
        assert_eq!(workspace.stream_hash, None);
        assert_eq!(workspace.directories["a"].stream_hash, None);
        assert_eq!(workspace.directories["x"].stream_hash, hash);
    }

    #[test]
    fn test_refresh_detects_drift() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut workspace = WorkspaceDirectory::default();
        stage(&mut workspace, root, "keep.txt", b"keep");
        stage(&mut workspace, root, "dir/modified.txt", b"before");
        stage(&mut workspace, root, "dir/deleted.txt", b"gone");
        workspace.directories.get_mut("dir").unwrap().stream_hash = Some(Hash::ZERO);

        fs::write(root.join("dir/modified.txt"), b"after, longer").unwrap();
        fs::remove_file(root.join("dir/deleted.txt")).unwrap();
        fs::write(root.join("untracked.txt"), b"u").unwrap();
        fs::create_dir_all(root.join("stray/inner")).unwrap();

        let result = workspace.refresh(root, false).unwrap();
        assert_eq!(result.files_to_delete, vec![root.join("dir/modified.txt")]);
        assert!(result.directories_to_delete.is_empty());
        assert_eq!(workspace.file_count(), 1);
        assert!(workspace.find_file("keep.txt").is_some());
        assert_eq!(workspace.directories["dir"].stream_hash, None);
    }

    #[test]
    fn test_refresh_remove_untracked() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut workspace = WorkspaceDirectory::default();
        stage(&mut workspace, root, "tracked/a.txt", b"a");
        fs::write(root.join("tracked/extra.txt"), b"x").unwrap();
        fs::create_dir_all(root.join("stray")).unwrap();

        let result = workspace.refresh(root, true).unwrap();
        assert_eq!(result.files_to_delete, vec![root.join("tracked/extra.txt")]);
        assert_eq!(result.directories_to_delete, vec![root.join("stray")]);
        assert_eq!(workspace.file_count(), 1);
    }

    #[test]
    fn test_refresh_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut workspace = WorkspaceDirectory::default();
        stage(&mut workspace, root, "dir/a.txt", b"a");
        fs::remove_dir_all(root.join("dir")).unwrap();

        let result = workspace.refresh(root, true).unwrap();
        assert_eq!(result, RefreshResult::default());
        assert!(workspace.is_empty());
    }

    #[test]
    fn test_find_differences() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut workspace = WorkspaceDirectory::default();
        stage(&mut workspace, root, "same.txt", b"same");
        stage(&mut workspace, root, "sub/changed.txt", b"1");
        stage(&mut workspace, root, "sub/missing.txt", b"2");

        fs::write(root.join("sub/changed.txt"), b"123").unwrap();
        fs::remove_file(root.join("sub/missing.txt")).unwrap();
        fs::write(root.join("sub/new.txt"), b"n").unwrap();
        fs::create_dir_all(root.join("newdir")).unwrap();

        let differences = workspace.find_differences(root).unwrap();
        assert_eq!(
            differences,
            vec!["!sub/changed.txt", "+newdir/", "+sub/new.txt", "-sub/missing.txt"]
        );

        // Read-only: nothing was dropped.
        assert_eq!(workspace.file_count(), 3);
    }

    #[test]
    fn test_encode_decode() {
        let mut workspace = WorkspaceDirectory::default();
        let stamp = FileStamp {
            length: 42,
            last_modified: 1_700_000_000_000_000_000,
            read_only: true,
        };
        workspace.add_file("a/b/c.bin", stamp, content(b"c")).unwrap();
        workspace.add_file("d.bin", stamp, content(b"d")).unwrap();
        workspace.directories.get_mut("a").unwrap().stream_hash = Some(Hash::hash_bytes(b"a"));

        let mut enc = Encoder::new();
        workspace.encode(&mut enc);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        let decoded = WorkspaceDirectory::decode("", &mut dec).unwrap();
        assert!(dec.is_empty());
        assert_eq!(decoded, workspace);
    }

    #[test]
    fn test_update_stamp() {
        let mut workspace = WorkspaceDirectory::default();
        let planned = FileStamp {
            length: 5,
            last_modified: 0,
            read_only: false,
        };
        workspace.add_file("dir/f", planned, content(b"hello")).unwrap();

        let written = FileStamp {
            length: 5,
            last_modified: 99,
            read_only: true,
        };
        assert!(workspace.update_stamp("dir/f", written));
        assert_eq!(workspace.find_file("dir/f").unwrap().stamp(), written);
        assert!(!workspace.update_stamp("dir/nope", written));
    }
}
