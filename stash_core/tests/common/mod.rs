#![allow(dead_code)]

use stash_core::{
    CancellationFlag, Error, FetchRequest, FileRecord, LocalDepot, Repository, RepositoryConfig,
    Result, SyncRequest, Vcs,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const CLIENT: &str = "build-01";

/// A depot and a repository directory side by side in one temp dir.
pub struct Fixture {
    pub temp: TempDir,
    pub depot: LocalDepot,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let depot = LocalDepot::new(temp.path().join("depot"));
        Self { temp, depot }
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.temp.path().join("repo")
    }

    pub fn create_repo(&self) -> Repository {
        Repository::create(&self.repo_dir(), test_config()).unwrap()
    }

    pub fn submit(&self, stream: &str, files: &[(&str, &[u8])]) -> u32 {
        self.depot.submit(stream, files.iter().copied()).unwrap()
    }
}

pub fn test_config() -> RepositoryConfig {
    RepositoryConfig {
        sync_threads: 2,
        min_scratch_space: 0,
        checkpoint_interval: Duration::ZERO,
        ..RepositoryConfig::default()
    }
}

pub fn request(stream: &str, change: u32) -> SyncRequest {
    SyncRequest {
        client: CLIENT.to_string(),
        stream: stream.to_string(),
        change: Some(change),
        ..SyncRequest::default()
    }
}

pub fn read(repo: &Repository, path: &str) -> Vec<u8> {
    fs::read(repo.workspace_dir().join(path)).unwrap()
}

pub fn exists(repo: &Repository, path: &str) -> bool {
    repo.workspace_dir().join(path).exists()
}

/// Every file under `dir`, as sorted `/`-separated relative paths.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = ignore::WalkBuilder::new(dir)
        .standard_filters(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

/// Wraps a depot to count queries and inject fetch failures or
/// cancellation.
pub struct InstrumentedVcs<'a> {
    pub inner: &'a LocalDepot,
    pub queries: AtomicUsize,
    pub fail_fetch: AtomicBool,
    pub cancel_after_fetch: Option<CancellationFlag>,
}

impl<'a> InstrumentedVcs<'a> {
    pub fn new(inner: &'a LocalDepot) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
            fail_fetch: AtomicBool::new(false),
            cancel_after_fetch: None,
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Vcs for InstrumentedVcs<'_> {
    fn update_client(&self, client: &str, stream: &str, root: &Path) -> Result<()> {
        self.inner.update_client(client, stream, root)
    }

    fn delete_client(&self, client: &str) -> Result<()> {
        self.inner.delete_client(client)
    }

    fn latest_change(&self, stream: &str) -> Result<u32> {
        self.inner.latest_change(stream)
    }

    fn revert(&self, client: &str) -> Result<()> {
        self.inner.revert(client)
    }

    fn clear_have_table(&self, client: &str) -> Result<()> {
        self.inner.clear_have_table(client)
    }

    fn update_have_table(&self, client: &str, change: u32, view: &[String]) -> Result<()> {
        self.inner.update_have_table(client, change, view)
    }

    fn query_files(
        &self,
        client: &str,
        change: u32,
        view: &[String],
        sink: &mut dyn FnMut(FileRecord) -> Result<()>,
    ) -> Result<()> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query_files(client, change, view, sink)
    }

    fn fetch(&self, client: &str, requests: &[FetchRequest]) -> Result<()> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::vcs("server unavailable"));
        }
        self.inner.fetch(client, requests)?;
        if let Some(flag) = &self.cancel_after_fetch {
            flag.cancel();
        }
        Ok(())
    }
}
