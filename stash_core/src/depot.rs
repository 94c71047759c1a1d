//! A [`Vcs`] backed by plain directories, for offline use and tests.
//!
//! Layout under the depot root:
//! - `{stream}/{change}/...` holds every file of `//{stream}` as of `change`
//!
//! Depot paths take the form `//{stream}/{relative path}`. A file's
//! revision is the change that last modified it: the oldest change in the
//! unbroken run of changes, ending at the queried one, that hold the same
//! bytes at the same path.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::stamp;
use crate::vcs::{FetchRequest, FileRecord, Vcs};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone)]
struct ClientState {
    stream: String,
    root: PathBuf,
    have_change: Option<u32>,
}

/// Serves streams out of a directory tree.
#[derive(Debug)]
pub struct LocalDepot {
    root: PathBuf,
    clients: Mutex<HashMap<String, ClientState>>,
    files_fetched: AtomicUsize,
    bytes_fetched: AtomicU64,
}

/// True if `path` is selected by `view`.
///
/// Entries are path prefixes relative to the stream root. A leading `-`
/// excludes, and later entries win. An empty view selects everything.
pub fn view_matches(view: &[String], path: &str) -> bool {
    let Some(first) = view.first() else {
        return true;
    };
    let mut selected = first.starts_with('-');
    for entry in view {
        let (exclude, prefix) = match entry.strip_prefix('-') {
            Some(prefix) => (true, prefix),
            None => (false, entry.as_str()),
        };
        let prefix = prefix
            .trim_end_matches("...")
            .trim_end_matches('/');
        let matches = prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
        if matches {
            selected = !exclude;
        }
    }
    selected
}

fn stream_dir_name(stream: &str) -> Result<&str> {
    stream
        .strip_prefix("//")
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| Error::vcs(format!("invalid stream name '{}'", stream)))
}

impl LocalDepot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clients: Mutex::new(HashMap::new()),
            files_fetched: AtomicUsize::new(0),
            bytes_fetched: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_root(&self, stream: &str) -> Result<PathBuf> {
        Ok(self.root.join(stream_dir_name(stream)?))
    }

    fn client(&self, client: &str) -> Result<ClientState> {
        self.clients
            .lock()
            .get(client)
            .cloned()
            .ok_or_else(|| Error::vcs(format!("unknown client '{}'", client)))
    }

    /// Write a new change to `stream` containing exactly `files`.
    /// Returns the new change number.
    pub fn submit<'a>(
        &self,
        stream: &str,
        files: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<u32> {
        let change = match self.changes(stream)?.last() {
            Some(latest) => latest + 1,
            None => 1,
        };
        let change_root = self.stream_root(stream)?.join(change.to_string());
        fs::create_dir_all(&change_root)?;
        for (path, data) in files {
            let target = change_root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, data)?;
        }
        debug!("Submitted change {} to {}", change, stream);
        Ok(change)
    }

    /// Every change of `stream`, ascending.
    pub fn changes(&self, stream: &str) -> Result<Vec<u32>> {
        let stream_root = self.stream_root(stream)?;
        if !stream_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut changes = Vec::new();
        for entry in fs::read_dir(&stream_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(change) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                changes.push(change);
            }
        }
        changes.sort_unstable();
        Ok(changes)
    }

    /// Number of files written by `fetch` so far.
    pub fn files_fetched(&self) -> usize {
        self.files_fetched.load(Ordering::SeqCst)
    }

    /// Number of bytes written by `fetch` so far.
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched.load(Ordering::SeqCst)
    }

    pub fn reset_stats(&self) {
        self.files_fetched.store(0, Ordering::SeqCst);
        self.bytes_fetched.store(0, Ordering::SeqCst);
    }

    /// The change last recorded in the have table of `client`.
    pub fn have_change(&self, client: &str) -> Option<u32> {
        self.clients
            .lock()
            .get(client)
            .and_then(|state| state.have_change)
    }

    /// The change that last modified the file at `relative`, whose bytes
    /// as of `change` are `data`. `earlier` lists the stream's changes
    /// before `change`, ascending.
    fn last_modified_in(
        stream_root: &Path,
        relative: &Path,
        data: &[u8],
        change: u32,
        earlier: &[u32],
    ) -> Result<u32> {
        let mut revision = change;
        for previous in earlier.iter().rev() {
            let candidate = stream_root.join(previous.to_string()).join(relative);
            let same_length = fs::metadata(&candidate)
                .is_ok_and(|meta| meta.is_file() && meta.len() == data.len() as u64);
            if !same_length || fs::read(&candidate)? != data {
                break;
            }
            revision = *previous;
        }
        Ok(revision)
    }

    fn resolve(&self, depot_path: &str, revision: i32) -> Result<PathBuf> {
        let rest = depot_path
            .strip_prefix("//")
            .ok_or_else(|| Error::vcs(format!("invalid depot path '{}'", depot_path)))?;
        let (stream, relative) = rest
            .split_once('/')
            .ok_or_else(|| Error::vcs(format!("invalid depot path '{}'", depot_path)))?;
        if relative
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(Error::vcs(format!("invalid depot path '{}'", depot_path)));
        }
        Ok(self
            .root
            .join(stream)
            .join(revision.to_string())
            .join(relative))
    }
}

impl Vcs for LocalDepot {
    fn update_client(&self, client: &str, stream: &str, root: &Path) -> Result<()> {
        stream_dir_name(stream)?;
        let mut clients = self.clients.lock();
        let have_change = clients
            .get(client)
            .filter(|state| state.stream == stream)
            .and_then(|state| state.have_change);
        clients.insert(
            client.to_string(),
            ClientState {
                stream: stream.to_string(),
                root: root.to_path_buf(),
                have_change,
            },
        );
        debug!("Client {} maps {} to {}", client, stream, root.display());
        Ok(())
    }

    fn delete_client(&self, client: &str) -> Result<()> {
        self.clients.lock().remove(client);
        Ok(())
    }

    fn latest_change(&self, stream: &str) -> Result<u32> {
        self.changes(stream)?
            .last()
            .copied()
            .ok_or_else(|| Error::vcs(format!("stream {} has no changes", stream)))
    }

    fn revert(&self, client: &str) -> Result<()> {
        self.client(client).map(|_| ())
    }

    fn clear_have_table(&self, client: &str) -> Result<()> {
        match self.clients.lock().get_mut(client) {
            Some(state) => {
                state.have_change = None;
                Ok(())
            }
            None => Err(Error::vcs(format!("unknown client '{}'", client))),
        }
    }

    fn update_have_table(&self, client: &str, change: u32, _view: &[String]) -> Result<()> {
        match self.clients.lock().get_mut(client) {
            Some(state) => {
                state.have_change = Some(change);
                Ok(())
            }
            None => Err(Error::vcs(format!("unknown client '{}'", client))),
        }
    }

    fn query_files(
        &self,
        client: &str,
        change: u32,
        view: &[String],
        sink: &mut dyn FnMut(FileRecord) -> Result<()>,
    ) -> Result<()> {
        let state = self.client(client)?;
        let stream_root = self.stream_root(&state.stream)?;
        let change_root = stream_root.join(change.to_string());
        if !change_root.is_dir() {
            return Err(Error::vcs(format!(
                "change {} not found in {}",
                change, state.stream
            )));
        }
        let earlier: Vec<u32> = self
            .changes(&state.stream)?
            .into_iter()
            .filter(|previous| *previous < change)
            .collect();

        let walker = ignore::WalkBuilder::new(&change_root)
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&change_root)
                .map_err(|_| Error::invalid_path(entry.path().display().to_string(), "outside change"))?;
            let client_path = relative
                .iter()
                .map(|part| {
                    part.to_str().ok_or_else(|| {
                        Error::invalid_path(relative.display().to_string(), "not valid UTF-8")
                    })
                })
                .collect::<Result<Vec<_>>>()?
                .join("/");
            if !view_matches(view, &client_path) {
                continue;
            }

            let data = fs::read(entry.path())?;
            let revision = Self::last_modified_in(&stream_root, relative, &data, change, &earlier)?;
            let file_type = if std::str::from_utf8(&data).is_ok() {
                "text"
            } else {
                "binary"
            };
            sink(FileRecord {
                depot_path: format!("{}/{}", state.stream, client_path),
                client_path,
                length: data.len() as u64,
                digest: Hash::hash_bytes(&data),
                file_type: file_type.to_string(),
                revision: revision as i32,
            })?;
        }
        Ok(())
    }

    fn fetch(&self, client: &str, requests: &[FetchRequest]) -> Result<()> {
        let state = self.client(client)?;
        for request in requests {
            if !request.local_path.starts_with(&state.root) {
                return Err(Error::vcs(format!(
                    "{} is outside the root of client {}",
                    request.local_path.display(),
                    client
                )));
            }
            let source = self.resolve(&request.depot_path, request.revision)?;
            if let Some(parent) = request.local_path.parent() {
                fs::create_dir_all(parent)?;
            }
            stamp::remove_file(&request.local_path)?;
            let bytes = fs::copy(&source, &request.local_path).map_err(|e| {
                Error::vcs(format!(
                    "failed to fetch {}#{}: {}",
                    request.depot_path, request.revision, e
                ))
            })?;
            self.files_fetched.fetch_add(1, Ordering::SeqCst);
            self.bytes_fetched.fetch_add(bytes, Ordering::SeqCst);
            debug!(
                "Fetched {}#{} to {}",
                request.depot_path,
                request.revision,
                request.local_path.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn view(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|entry| entry.to_string()).collect()
    }

    fn query(depot: &LocalDepot, client: &str, change: u32, filter: &[String]) -> Vec<FileRecord> {
        let mut records = Vec::new();
        depot
            .query_files(client, change, filter, &mut |record| {
                records.push(record);
                Ok(())
            })
            .unwrap();
        records
    }

    #[test]
    fn test_view_matches() {
        assert!(view_matches(&[], "anything"));

        let include = view(&["Engine/", "Game/Content/..."]);
        assert!(view_matches(&include, "Engine/a.cpp"));
        assert!(view_matches(&include, "Game/Content/map.umap"));
        assert!(!view_matches(&include, "Game/Source/x.cpp"));
        assert!(!view_matches(&include, "EngineExtra/a"));

        let exclude = view(&["-Engine/Binaries", "Engine/Binaries/keep.dll"]);
        assert!(view_matches(&exclude, "README"));
        assert!(!view_matches(&exclude, "Engine/Binaries/x.dll"));
        assert!(view_matches(&exclude, "Engine/Binaries/keep.dll"));
    }

    #[test]
    fn test_submit_and_latest_change() {
        let temp = TempDir::new().unwrap();
        let depot = LocalDepot::new(temp.path());
        assert!(depot.latest_change("//main").is_err());

        assert_eq!(depot.submit("//main", [("a.txt", &b"one"[..])]).unwrap(), 1);
        assert_eq!(depot.submit("//main", [("a.txt", &b"two"[..])]).unwrap(), 2);
        assert_eq!(depot.latest_change("//main").unwrap(), 2);
        assert!(depot.submit("main", [("a", &b""[..])]).is_err());
    }

    #[test]
    fn test_query_files() {
        let temp = TempDir::new().unwrap();
        let depot = LocalDepot::new(temp.path().join("depot"));
        let change = depot
            .submit(
                "//main",
                [
                    ("Engine/b.bin", &b"\xff\xfe"[..]),
                    ("Engine/a.txt", &b"hello"[..]),
                    (".hidden", &b"h"[..]),
                ],
            )
            .unwrap();

        depot
            .update_client("ws", "//main", &temp.path().join("ws"))
            .unwrap();
        let records = query(&depot, "ws", change, &[]);
        let paths: Vec<_> = records.iter().map(|r| r.client_path.as_str()).collect();
        assert_eq!(paths, vec![".hidden", "Engine/a.txt", "Engine/b.bin"]);

        let text = &records[1];
        assert_eq!(text.depot_path, "//main/Engine/a.txt");
        assert_eq!(text.file_type, "text");
        assert_eq!(text.digest, Hash::hash_bytes(b"hello"));
        assert_eq!(text.revision, change as i32);
        assert_eq!(records[2].file_type, "binary");

        let filtered = query(&depot, "ws", change, &view(&["-Engine/b.bin"]));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_revision_is_last_modifying_change() {
        let temp = TempDir::new().unwrap();
        let depot = LocalDepot::new(temp.path().join("depot"));
        depot
            .submit("//main", [("a.txt", &b"a"[..]), ("b.txt", &b"b1"[..])])
            .unwrap();
        depot
            .submit("//main", [("a.txt", &b"a"[..]), ("b.txt", &b"b2"[..])])
            .unwrap();
        depot
            .submit("//main", [("a.txt", &b"a"[..]), ("b.txt", &b"b2"[..])])
            .unwrap();
        // Deleted, then added back with the same bytes.
        depot.submit("//main", [("b.txt", &b"b2"[..])]).unwrap();
        depot
            .submit("//main", [("a.txt", &b"a"[..]), ("b.txt", &b"b2"[..])])
            .unwrap();
        depot
            .update_client("ws", "//main", &temp.path().join("ws"))
            .unwrap();

        let revisions = |change| -> Vec<(String, i32)> {
            query(&depot, "ws", change, &[])
                .into_iter()
                .map(|record| (record.client_path, record.revision))
                .collect()
        };
        assert_eq!(
            revisions(3),
            vec![("a.txt".to_string(), 1), ("b.txt".to_string(), 2)]
        );
        assert_eq!(
            revisions(5),
            vec![("a.txt".to_string(), 5), ("b.txt".to_string(), 2)]
        );
        // Querying an older change ignores later ones.
        assert_eq!(
            revisions(1),
            vec![("a.txt".to_string(), 1), ("b.txt".to_string(), 1)]
        );
    }

    #[test]
    fn test_fetch() {
        let temp = TempDir::new().unwrap();
        let depot = LocalDepot::new(temp.path().join("depot"));
        let ws = temp.path().join("ws");
        depot.submit("//main", [("dir/f", &b"v1"[..])]).unwrap();
        depot.submit("//main", [("dir/f", &b"v2!"[..])]).unwrap();
        depot.update_client("ws", "//main", &ws).unwrap();

        let request = |revision| FetchRequest {
            depot_path: "//main/dir/f".into(),
            revision,
            local_path: ws.join("dir/f"),
        };
        depot.fetch("ws", &[request(1)]).unwrap();
        assert_eq!(fs::read(ws.join("dir/f")).unwrap(), b"v1");
        depot.fetch("ws", &[request(2)]).unwrap();
        assert_eq!(fs::read(ws.join("dir/f")).unwrap(), b"v2!");
        assert_eq!(depot.files_fetched(), 2);
        assert_eq!(depot.bytes_fetched(), 5);

        assert!(depot.fetch("ws", &[request(3)]).is_err());
        assert!(depot.fetch("other", &[request(1)]).is_err());
        let outside = FetchRequest {
            local_path: temp.path().join("elsewhere"),
            ..request(1)
        };
        assert!(depot.fetch("ws", &[outside]).is_err());
    }

    #[test]
    fn test_have_table() {
        let temp = TempDir::new().unwrap();
        let depot = LocalDepot::new(temp.path());
        assert!(depot.update_have_table("ws", 1, &[]).is_err());

        depot.update_client("ws", "//main", temp.path()).unwrap();
        depot.update_have_table("ws", 3, &[]).unwrap();
        assert_eq!(depot.have_change("ws"), Some(3));
        depot.clear_have_table("ws").unwrap();
        assert_eq!(depot.have_change("ws"), None);

        depot.delete_client("ws").unwrap();
        assert!(depot.revert("ws").is_err());
    }
}
