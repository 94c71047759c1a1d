//! Plans that reconcile the workspace tree with a target snapshot.
//!
//! A sync is applied in two phases. [`RemoveTransaction`] takes away every
//! staged file the target does not want, parking reusable content in the
//! cache. [`AddTransaction`] then stages every file the target needs,
//! preferring a local copy, then a move out of the cache, and only then a
//! fetch from the server.
//!
//! Both walk the target tree with an explicit stack and skip any directory
//! whose recorded stream hash equals the target node's hash, so unchanged
//! subtrees cost one comparison regardless of how many files they hold.

use crate::cache::{CachedFileInfo, ContentCache};
use crate::content::FileContentId;
use crate::error::Result;
use crate::snapshot::{StreamFile, StreamSnapshot, StreamTreeRef};
use crate::stamp::FileStamp;
use crate::workspace::{WorkspaceDirectory, WorkspaceFile};
use std::collections::{HashMap, HashSet};

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// A staged file that the removal phase takes out of the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedFile {
    pub path: String,
    pub file: WorkspaceFile,
}

/// Removal phase plan.
#[derive(Debug)]
pub struct RemoveTransaction {
    /// The workspace tree once the plan has been applied.
    pub new_workspace: WorkspaceDirectory,
    /// Files whose content is already cached or otherwise redundant.
    pub files_to_delete: Vec<RemovedFile>,
    /// Files to rename into the cache. Content ids are unique.
    pub files_to_move_to_cache: Vec<RemovedFile>,
    /// Directories to delete, deepest first.
    pub directories_to_delete: Vec<String>,
    /// Number of directories whose contents were compared.
    pub directories_visited: usize,
}

impl RemoveTransaction {
    pub fn new(
        workspace: &WorkspaceDirectory,
        snapshot: &dyn StreamSnapshot,
        cache: &ContentCache,
    ) -> Result<Self> {
        let mut tx = RemoveTransaction {
            new_workspace: workspace.clone(),
            files_to_delete: Vec::new(),
            files_to_move_to_cache: Vec::new(),
            directories_to_delete: Vec::new(),
            directories_visited: 0,
        };
        let mut scheduled: HashSet<FileContentId> = HashSet::new();

        let mut stack: Vec<(String, StreamTreeRef)> = vec![(String::new(), snapshot.root().clone())];
        while let Some((path, tree_ref)) = stack.pop() {
            let Some(dir) = tx.new_workspace.find_directory_mut(&path) else {
                continue;
            };
            if dir.stream_hash == Some(tree_ref.hash) {
                continue;
            }
            tx.directories_visited += 1;
            let tree = snapshot.lookup(&tree_ref)?;

            let mut removed = Vec::new();
            dir.files.retain(|name, file| {
                let keep = tree
                    .files
                    .get(name)
                    .is_some_and(|target| target.content_id == file.content_id);
                if !keep {
                    removed.push(RemovedFile {
                        path: join(&path, name),
                        file: file.clone(),
                    });
                }
                keep
            });

            let mut removed_dirs = Vec::new();
            dir.directories.retain(|name, child| {
                if tree.trees.contains_key(name) {
                    return true;
                }
                removed_dirs.push((join(&path, name), child.clone()));
                false
            });
            dir.stream_hash = None;

            for (name, child_ref) in tree.trees {
                if dir.directories.contains_key(&name) {
                    stack.push((join(&path, &name), child_ref));
                }
            }

            for (dir_path, child) in removed_dirs {
                for (file_path, file) in child.files() {
                    removed.push(RemovedFile {
                        path: join(&dir_path, &file_path),
                        file: file.clone(),
                    });
                }
                tx.directories_to_delete.extend(
                    child
                        .directory_paths()
                        .into_iter()
                        .map(|sub| join(&dir_path, &sub)),
                );
                tx.directories_to_delete.push(dir_path);
            }

            for file in removed {
                let content_id = &file.file.content_id;
                if cache.contains(content_id) || scheduled.contains(content_id) {
                    tx.files_to_delete.push(file);
                } else {
                    scheduled.insert(content_id.clone());
                    tx.files_to_move_to_cache.push(file);
                }
            }
        }

        tx.directories_to_delete
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Ok(tx)
    }

    /// True if applying the plan would not touch the filesystem.
    pub fn is_empty(&self) -> bool {
        self.files_to_delete.is_empty()
            && self.files_to_move_to_cache.is_empty()
            && self.directories_to_delete.is_empty()
    }
}

/// A file to copy from elsewhere in the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFile {
    /// Path of an already staged (or about to be moved) file with the
    /// same content.
    pub source: String,
    pub target: String,
    pub stream_file: StreamFile,
}

/// A cached blob to move into the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMove {
    pub entry: CachedFileInfo,
    pub target: String,
    pub stream_file: StreamFile,
}

/// A file that must be fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFile {
    pub target: String,
    pub stream_file: StreamFile,
}

/// Addition phase plan.
///
/// Copies whose source is the target of a cache move must run after the
/// moves.
#[derive(Debug)]
pub struct AddTransaction {
    /// The workspace tree once the plan has been applied. Planned files are
    /// tracked with a zero modification time until their real metadata is
    /// recorded.
    pub new_workspace: WorkspaceDirectory,
    pub files_to_copy: Vec<CopyFile>,
    pub files_to_move_from_cache: Vec<CacheMove>,
    pub files_to_sync: Vec<SyncFile>,
    /// Number of directories whose contents were compared.
    pub directories_visited: usize,
}

impl AddTransaction {
    pub fn new(
        workspace: &WorkspaceDirectory,
        snapshot: &dyn StreamSnapshot,
        cache: &ContentCache,
    ) -> Result<Self> {
        let mut tx = AddTransaction {
            new_workspace: workspace.clone(),
            files_to_copy: Vec::new(),
            files_to_move_from_cache: Vec::new(),
            files_to_sync: Vec::new(),
            directories_visited: 0,
        };

        if workspace.stream_hash == Some(snapshot.root().hash) {
            return Ok(tx);
        }

        // Where each piece of content is already staged.
        let mut staged: HashMap<FileContentId, String> = HashMap::new();
        for (path, file) in workspace.files() {
            staged.entry(file.content_id.clone()).or_insert(path);
        }

        let mut stack: Vec<(String, StreamTreeRef)> = vec![(String::new(), snapshot.root().clone())];
        let mut finished: Vec<(String, StreamTreeRef)> = Vec::new();
        while let Some((path, tree_ref)) = stack.pop() {
            if tx.new_workspace.find_directory(&path).is_none() {
                let (parent, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
                let Some(parent_dir) = tx.new_workspace.find_directory_mut(parent) else {
                    continue;
                };
                parent_dir
                    .directories
                    .insert(name.to_string(), WorkspaceDirectory::new(name));
            }
            let Some(dir) = tx.new_workspace.find_directory_mut(&path) else {
                continue;
            };
            if dir.stream_hash == Some(tree_ref.hash) {
                continue;
            }
            tx.directories_visited += 1;
            let tree = snapshot.lookup(&tree_ref)?;

            for (name, stream_file) in &tree.files {
                if dir
                    .files
                    .get(name)
                    .is_some_and(|file| file.content_id == stream_file.content_id)
                {
                    continue;
                }

                let target = join(&path, name);
                let content_id = &stream_file.content_id;
                if let Some(source) = staged.get(content_id) {
                    tx.files_to_copy.push(CopyFile {
                        source: source.clone(),
                        target: target.clone(),
                        stream_file: stream_file.clone(),
                    });
                } else if let Some(entry) = cache.get(content_id) {
                    tx.files_to_move_from_cache.push(CacheMove {
                        entry: entry.clone(),
                        target: target.clone(),
                        stream_file: stream_file.clone(),
                    });
                    staged.insert(content_id.clone(), target.clone());
                } else {
                    tx.files_to_sync.push(SyncFile {
                        target: target.clone(),
                        stream_file: stream_file.clone(),
                    });
                }

                let planned = FileStamp {
                    length: stream_file.length,
                    last_modified: 0,
                    read_only: false,
                };
                dir.files.insert(
                    name.clone(),
                    WorkspaceFile::new(name.clone(), planned, content_id.clone()),
                );
            }

            let matches_target = dir.files.keys().all(|name| tree.files.contains_key(name))
                && dir
                    .directories
                    .keys()
                    .all(|name| tree.trees.contains_key(name));
            if matches_target {
                finished.push((path.clone(), tree_ref.clone()));
            }
            dir.stream_hash = None;

            for (name, child_ref) in tree.trees {
                stack.push((join(&path, &name), child_ref));
            }
        }

        // A directory is only reconciled once everything below it is.
        // Finished directories were recorded parent first, so apply deepest
        // first and require every child to carry its target hash.
        for (path, tree_ref) in finished.into_iter().rev() {
            if let Some(dir) = tx.new_workspace.find_directory_mut(&path) {
                let children_done = dir
                    .directories
                    .values()
                    .all(|child| child.stream_hash.is_some());
                if children_done {
                    dir.stream_hash = Some(tree_ref.hash);
                }
            }
        }

        Ok(tx)
    }

    /// True if nothing needs to be copied, moved or fetched.
    pub fn is_empty(&self) -> bool {
        self.files_to_copy.is_empty()
            && self.files_to_move_from_cache.is_empty()
            && self.files_to_sync.is_empty()
    }

    /// Total bytes that must be fetched.
    pub fn bytes_to_sync(&self) -> u64 {
        self.files_to_sync
            .iter()
            .map(|file| file.stream_file.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::snapshot::tests::snapshot_of;
    use crate::snapshot::{MemorySnapshot, StreamTree};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn content(data: &[u8]) -> FileContentId {
        FileContentId::new(Hash::hash_bytes(data), "binary")
    }

    fn stamp(len: usize) -> FileStamp {
        FileStamp {
            length: len as u64,
            last_modified: 1,
            read_only: false,
        }
    }

    fn workspace_of(files: &[(&str, &[u8])]) -> WorkspaceDirectory {
        let mut workspace = WorkspaceDirectory::default();
        for (path, data) in files {
            workspace
                .add_file(path, stamp(data.len()), content(data))
                .unwrap();
        }
        workspace
    }

    /// Counts node lookups to check that unchanged subtrees are skipped.
    struct CountingSnapshot {
        inner: MemorySnapshot,
        lookups: AtomicUsize,
    }

    impl StreamSnapshot for CountingSnapshot {
        fn root(&self) -> &StreamTreeRef {
            self.inner.root()
        }

        fn lookup(&self, tree_ref: &StreamTreeRef) -> Result<StreamTree> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(tree_ref)
        }

        fn file_count(&self) -> usize {
            self.inner.file_count()
        }
    }

    /// Apply both phases to the tree only, as if every file operation had
    /// succeeded and written metadata matching the plan.
    fn apply(workspace: &WorkspaceDirectory, snapshot: &dyn StreamSnapshot) -> WorkspaceDirectory {
        let cache = ContentCache::new("/unused");
        let remove = RemoveTransaction::new(workspace, snapshot, &cache).unwrap();
        let add = AddTransaction::new(&remove.new_workspace, snapshot, &cache).unwrap();
        add.new_workspace
    }

    #[test]
    fn test_rename_is_a_copy_not_a_fetch() {
        let workspace = workspace_of(&[("main.uasset", b"D1")]);
        let snapshot = snapshot_of("//main", &[("renamed.uasset", b"D1")]);
        let mut cache = ContentCache::new("/unused");

        let remove = RemoveTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert_eq!(remove.files_to_move_to_cache.len(), 1);
        assert_eq!(remove.files_to_move_to_cache[0].path, "main.uasset");
        assert!(remove.files_to_delete.is_empty());

        // The orchestrator parks the removed file in the cache.
        let moved = &remove.files_to_move_to_cache[0].file;
        cache.register(moved.content_id.clone(), moved.stamp());

        let add = AddTransaction::new(&remove.new_workspace, &snapshot, &cache).unwrap();
        assert_eq!(add.files_to_move_from_cache.len(), 1);
        assert_eq!(add.files_to_move_from_cache[0].target, "renamed.uasset");
        assert!(add.files_to_copy.is_empty());
        assert!(add.files_to_sync.is_empty());
        assert!(add.new_workspace.find_file("main.uasset").is_none());
        assert!(add.new_workspace.find_file("renamed.uasset").is_some());
    }

    #[test]
    fn test_staged_content_is_copied() {
        let workspace = workspace_of(&[("a/original.bin", b"X")]);
        let snapshot = snapshot_of("//main", &[("a/original.bin", b"X"), ("b/copy.bin", b"X")]);
        let cache = ContentCache::new("/unused");

        let remove = RemoveTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert!(remove.is_empty());

        let add = AddTransaction::new(&remove.new_workspace, &snapshot, &cache).unwrap();
        assert_eq!(
            add.files_to_copy,
            vec![CopyFile {
                source: "a/original.bin".into(),
                target: "b/copy.bin".into(),
                stream_file: add.files_to_copy[0].stream_file.clone(),
            }]
        );
        assert!(add.files_to_sync.is_empty());
    }

    #[test]
    fn test_second_target_copies_from_cache_move() {
        let workspace = WorkspaceDirectory::default();
        let snapshot = snapshot_of("//main", &[("one.bin", b"S"), ("two.bin", b"S")]);
        let mut cache = ContentCache::new("/unused");
        cache.register(content(b"S"), stamp(1));

        let add = AddTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert_eq!(add.files_to_move_from_cache.len(), 1);
        assert_eq!(add.files_to_copy.len(), 1);
        assert_eq!(
            add.files_to_copy[0].source,
            add.files_to_move_from_cache[0].target
        );
        assert!(add.files_to_sync.is_empty());
    }

    #[test]
    fn test_missing_content_is_fetched() {
        let workspace = WorkspaceDirectory::default();
        let snapshot = snapshot_of("//main", &[("dir/new.bin", b"new"), ("x", b"xx")]);
        let cache = ContentCache::new("/unused");

        let add = AddTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert_eq!(add.files_to_sync.len(), 2);
        assert_eq!(add.bytes_to_sync(), 5);
        assert_eq!(
            add.new_workspace.find_file("dir/new.bin").unwrap().last_modified,
            0
        );
    }

    #[test]
    fn test_remove_cached_content_is_deleted() {
        let workspace = workspace_of(&[("a", b"dup"), ("b", b"dup"), ("c", b"cached")]);
        let snapshot = snapshot_of("//main", &[]);
        let mut cache = ContentCache::new("/unused");
        cache.register(content(b"cached"), stamp(6));

        let remove = RemoveTransaction::new(&workspace, &snapshot, &cache).unwrap();
        // One copy of "dup" is parked, the other deleted; "c" is already cached.
        assert_eq!(remove.files_to_move_to_cache.len(), 1);
        assert_eq!(remove.files_to_delete.len(), 2);
        assert!(remove.new_workspace.is_empty());
    }

    #[test]
    fn test_directories_deleted_child_first() {
        let workspace = workspace_of(&[("gone/deeper/deepest/f", b"f"), ("gone/g", b"g"), ("kept/k", b"k")]);
        let snapshot = snapshot_of("//main", &[("kept/k", b"k")]);
        let cache = ContentCache::new("/unused");

        let remove = RemoveTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert_eq!(
            remove.directories_to_delete,
            vec!["gone/deeper/deepest", "gone/deeper", "gone"]
        );
        assert_eq!(remove.files_to_move_to_cache.len(), 2);
    }

    #[test]
    fn test_changed_content_is_replaced() {
        let workspace = workspace_of(&[("file.txt", b"old")]);
        let snapshot = snapshot_of("//main", &[("file.txt", b"new")]);
        let cache = ContentCache::new("/unused");

        let remove = RemoveTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert_eq!(remove.files_to_move_to_cache.len(), 1);

        let add = AddTransaction::new(&remove.new_workspace, &snapshot, &cache).unwrap();
        assert_eq!(add.files_to_sync.len(), 1);
        assert_eq!(
            add.new_workspace.find_file("file.txt").unwrap().content_id,
            content(b"new")
        );
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let snapshot = snapshot_of(
            "//main",
            &[("a/b/c", b"c"), ("a/d", b"d"), ("e", b"e")],
        );
        let synced = apply(&WorkspaceDirectory::default(), &snapshot);
        assert_eq!(synced.stream_hash, Some(snapshot.root().hash));

        let cache = ContentCache::new("/unused");
        let remove = RemoveTransaction::new(&synced, &snapshot, &cache).unwrap();
        assert!(remove.is_empty());
        assert_eq!(remove.directories_visited, 0);

        let add = AddTransaction::new(&remove.new_workspace, &snapshot, &cache).unwrap();
        assert!(add.is_empty());
        assert_eq!(add.directories_visited, 0);
    }

    #[test]
    fn test_unchanged_subtrees_are_not_visited() {
        let mut files: Vec<(String, Vec<u8>)> = (0..50)
            .map(|i| (format!("big/dir{}/file{}", i % 5, i), vec![i as u8; 4]))
            .collect();
        files.push(("small/changing".into(), b"v1".to_vec()));
        let as_refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(path, data)| (path.as_str(), data.as_slice()))
            .collect();
        let before = snapshot_of("//main", &as_refs);
        let synced = apply(&WorkspaceDirectory::default(), &before);

        files.last_mut().unwrap().1 = b"v2".to_vec();
        let as_refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(path, data)| (path.as_str(), data.as_slice()))
            .collect();
        let after = CountingSnapshot {
            inner: snapshot_of("//main", &as_refs),
            lookups: AtomicUsize::new(0),
        };

        let cache = ContentCache::new("/unused");
        let remove = RemoveTransaction::new(&synced, &after, &cache).unwrap();
        // Root and "small" only; "big" and its five children are skipped.
        assert_eq!(remove.directories_visited, 2);
        assert_eq!(after.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(remove.files_to_move_to_cache.len(), 1);

        let add = AddTransaction::new(&remove.new_workspace, &after, &cache).unwrap();
        assert_eq!(add.directories_visited, 2);
        assert_eq!(add.files_to_sync.len(), 1);
        assert_eq!(add.new_workspace.stream_hash, Some(after.root().hash));
    }

    #[test]
    fn test_extra_files_block_stream_hash() {
        // Add alone does not remove "extra", so the directory must not
        // claim to match the target.
        let workspace = workspace_of(&[("dir/extra", b"x")]);
        let snapshot = snapshot_of("//main", &[("dir/wanted", b"w")]);
        let cache = ContentCache::new("/unused");

        let add = AddTransaction::new(&workspace, &snapshot, &cache).unwrap();
        assert_eq!(add.new_workspace.directories["dir"].stream_hash, None);
        assert_eq!(add.new_workspace.stream_hash, None);
    }
}
