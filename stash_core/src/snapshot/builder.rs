//! Incremental construction of a stream tree from file metadata records.

use super::tree::{StreamFile, StreamTree, StreamTreeRef, parent_for};
use crate::error::{Error, Result};
use crate::hash::Hash;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct BuilderNode {
    files: BTreeMap<String, StreamFile>,
    /// Child name to index in `StreamTreeBuilder::nodes`.
    trees: BTreeMap<String, usize>,
}

/// Accumulates files into mutable directory nodes, then freezes them into
/// hash-addressed [`StreamTree`] nodes.
///
/// Metadata queries return records roughly sorted by path, so the builder
/// remembers the directory fragments matched for the previous record and
/// reuses as many of them as possible for the next one instead of walking
/// down from the root each time.
#[derive(Debug)]
pub struct StreamTreeBuilder {
    /// Arena of directory nodes; index 0 is the root.
    nodes: Vec<BuilderNode>,
    /// Fragments of the last matched directory path and their node indices.
    fragments: Vec<(String, usize)>,
    file_count: usize,
}

impl Default for StreamTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTreeBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![BuilderNode::default()],
            fragments: Vec::new(),
            file_count: 0,
        }
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }

    /// Add a file at `client_path`, a `/`-separated path relative to the
    /// workspace root.
    pub fn add_file(&mut self, client_path: &str, file: StreamFile) -> Result<()> {
        let (dir, name) = match client_path.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, client_path),
        };
        if name.is_empty() {
            return Err(Error::invalid_path(client_path, "empty file name"));
        }

        let mut node = 0;
        let mut depth = 0;
        for fragment in dir.into_iter().flat_map(|dir| dir.split('/')) {
            if fragment.is_empty() || fragment == "." || fragment == ".." {
                return Err(Error::invalid_path(
                    client_path,
                    format!("invalid path fragment '{}'", fragment),
                ));
            }

            if let Some((last, index)) = self.fragments.get(depth) {
                if last == fragment {
                    node = *index;
                    depth += 1;
                    continue;
                }
                self.fragments.truncate(depth);
            }

            node = self.child(node, fragment);
            self.fragments.push((fragment.to_string(), node));
            depth += 1;
        }
        self.fragments.truncate(depth);

        if self.nodes[node].files.insert(name.to_string(), file).is_some() {
            return Err(Error::invalid_path(client_path, "duplicate file"));
        }
        self.file_count += 1;
        Ok(())
    }

    fn child(&mut self, parent: usize, name: &str) -> usize {
        if let Some(index) = self.nodes[parent].trees.get(name) {
            return *index;
        }
        let index = self.nodes.len();
        self.nodes.push(BuilderNode::default());
        self.nodes[parent].trees.insert(name.to_string(), index);
        index
    }

    /// Freeze every node, registering its encoding in `registry` under its
    /// hash, and return a reference to the root.
    pub fn encode(self, registry: &mut HashMap<Hash, Vec<u8>>) -> StreamTreeRef {
        let mut refs: Vec<Option<StreamTreeRef>> = vec![None; self.nodes.len()];

        // Children are always allocated after their parent, so a reverse
        // sweep freezes every child before the node that references it.
        for (index, node) in self.nodes.into_iter().enumerate().rev() {
            let trees: BTreeMap<String, StreamTreeRef> = node
                .trees
                .into_iter()
                .filter_map(|(name, child)| refs[child].take().map(|tree_ref| (name, tree_ref)))
                .collect();

            let mut tree = StreamTree::new(infer_base_path(&node.files, &trees));
            tree.files = node.files;
            tree.trees = trees;

            let data = tree.encode();
            let hash = Hash::hash_bytes(&data);
            registry.entry(hash).or_insert(data);
            refs[index] = Some(StreamTreeRef {
                base_path: tree.base_path,
                hash,
            });
        }

        refs.into_iter().next().flatten().unwrap_or_else(|| {
            let empty = StreamTree::default().encode();
            let hash = Hash::hash_bytes(&empty);
            registry.entry(hash).or_insert(empty);
            StreamTreeRef {
                base_path: String::new(),
                hash,
            }
        })
    }
}

/// The parent directory shared by the most children. Ties go to the
/// lexicographically smallest path so the result is deterministic.
fn infer_base_path(
    files: &BTreeMap<String, StreamFile>,
    trees: &BTreeMap<String, StreamTreeRef>,
) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let candidates = files
        .iter()
        .map(|(name, file)| parent_for(&file.path, name))
        .chain(
            trees
                .iter()
                .map(|(name, tree)| parent_for(&tree.base_path, name)),
        );
    for parent in candidates.flatten() {
        *counts.entry(parent).or_default() += 1;
    }

    counts
        .into_iter()
        .max_by(|(path_a, count_a), (path_b, count_b)| {
            count_a.cmp(count_b).then_with(|| path_b.cmp(path_a))
        })
        .map(|(path, _)| path)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::FileContentId;

    fn file(path: &str, data: &[u8]) -> StreamFile {
        StreamFile {
            path: path.to_string(),
            length: data.len() as u64,
            content_id: FileContentId::new(Hash::hash_bytes(data), "binary"),
            revision: 1,
        }
    }

    fn build(stream: &str, paths: &[(&str, &[u8])]) -> (StreamTreeRef, HashMap<Hash, Vec<u8>>) {
        let mut builder = StreamTreeBuilder::new();
        for (path, data) in paths {
            builder
                .add_file(path, file(&format!("{}/{}", stream, path), data))
                .unwrap();
        }
        let mut registry = HashMap::new();
        let root = builder.encode(&mut registry);
        (root, registry)
    }

    fn lookup(registry: &HashMap<Hash, Vec<u8>>, tree_ref: &StreamTreeRef) -> StreamTree {
        StreamTree::decode(&tree_ref.base_path, &registry[&tree_ref.hash]).unwrap()
    }

    #[test]
    fn test_build_nested() {
        let (root, registry) = build(
            "//main",
            &[
                ("Engine/Source/a.cpp", b"a"),
                ("Engine/Source/b.cpp", b"b"),
                ("Engine/Build.version", b"v"),
                ("README.md", b"r"),
            ],
        );

        assert_eq!(root.base_path, "//main");
        let tree = lookup(&registry, &root);
        assert_eq!(tree.files.len(), 1);
        assert_eq!(tree.files["README.md"].path, "//main/README.md");

        let engine = lookup(&registry, &tree.trees["Engine"]);
        assert_eq!(engine.base_path, "//main/Engine");
        let source = lookup(&registry, &engine.trees["Source"]);
        assert_eq!(source.files["b.cpp"].path, "//main/Engine/Source/b.cpp");
    }

    #[test]
    fn test_fragment_cache_handles_unsorted_input() {
        let (sorted, _) = build(
            "//main",
            &[("A/x", b"1"), ("A/y", b"2"), ("B/z", b"3"), ("B/C/w", b"4")],
        );
        let (shuffled, _) = build(
            "//main",
            &[("B/C/w", b"4"), ("A/y", b"2"), ("B/z", b"3"), ("A/x", b"1")],
        );
        assert_eq!(sorted, shuffled);
    }

    #[test]
    fn test_identical_subtrees_share_hash() {
        let (main, main_registry) = build(
            "//main",
            &[("Shared/a", b"a"), ("Shared/b", b"b"), ("Only/c", b"c")],
        );
        let (dev, dev_registry) = build(
            "//dev",
            &[("Shared/a", b"a"), ("Shared/b", b"b"), ("Only/c", b"changed")],
        );

        let main_root = lookup(&main_registry, &main);
        let dev_root = lookup(&dev_registry, &dev);
        assert_eq!(
            main_root.trees["Shared"].hash,
            dev_root.trees["Shared"].hash
        );
        assert_ne!(main_root.trees["Only"].hash, dev_root.trees["Only"].hash);
        assert_ne!(main.hash, dev.hash);
    }

    #[test]
    fn test_base_path_inference_uses_majority() {
        let mut builder = StreamTreeBuilder::new();
        builder.add_file("Dir/a", file("//main/Dir/a", b"a")).unwrap();
        builder.add_file("Dir/b", file("//main/Dir/b", b"b")).unwrap();
        builder.add_file("Dir/c", file("//main/Elsewhere/c", b"c")).unwrap();

        let mut registry = HashMap::new();
        let root = builder.encode(&mut registry);
        let dir_ref = lookup(&registry, &root).trees["Dir"].clone();
        assert_eq!(dir_ref.base_path, "//main/Dir");

        let dir = lookup(&registry, &dir_ref);
        assert_eq!(dir.files["c"].path, "//main/Elsewhere/c");
    }

    #[test]
    fn test_empty_builder() {
        let mut registry = HashMap::new();
        let root = StreamTreeBuilder::new().encode(&mut registry);
        assert_eq!(root.base_path, "");
        assert!(lookup(&registry, &root).files.is_empty());
    }

    #[test]
    fn test_rejects_bad_paths() {
        let mut builder = StreamTreeBuilder::new();
        assert!(builder.add_file("a//b", file("//m/a/b", b"")).is_err());
        assert!(builder.add_file("a/../b", file("//m/b", b"")).is_err());
        assert!(builder.add_file("dir/", file("//m/dir", b"")).is_err());

        builder.add_file("x", file("//m/x", b"")).unwrap();
        assert!(builder.add_file("x", file("//m/x", b"")).is_err());
        assert_eq!(builder.file_count(), 1);
    }
}
