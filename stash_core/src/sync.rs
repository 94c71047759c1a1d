//! Workflows that talk to the version control server: switching the
//! workspace to a stream, populating the cache from several streams, and
//! client housekeeping.

use crate::content::FileContentId;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::repository::{Repository, RepositoryState};
use crate::snapshot::{self, MemorySnapshot, StoredSnapshot, StreamSnapshot, StreamTreeBuilder};
use crate::stamp;
use crate::transaction::{AddTransaction, RemoveTransaction, SyncFile};
use crate::vcs::{FetchRequest, Vcs};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of [`Repository::sync`].
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub client: String,
    /// Stream name, such as `//main`.
    pub stream: String,
    /// Change to sync to. `None` means the latest change.
    pub change: Option<u32>,
    /// Path prefixes to include, or exclude with a leading `-`.
    pub view: Vec<String>,
    pub remove_untracked: bool,
    /// File shared between machines syncing the same stream. Read if it
    /// holds a snapshot of the stream, otherwise written after the query.
    pub snapshot_cache: Option<PathBuf>,
}

/// One stream for [`Repository::populate`].
#[derive(Debug, Clone, Default)]
pub struct PopulateRequest {
    pub client: String,
    pub stream: String,
    pub view: Vec<String>,
}

/// What the removal phase did.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RemoveStats {
    pub files_deleted: usize,
    pub files_moved_to_cache: usize,
    pub directories_deleted: usize,
    /// Files and directories that could not be deleted.
    pub delete_failures: usize,
}

/// What the addition phase did.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AddStats {
    pub files_moved_from_cache: usize,
    pub files_copied: usize,
    pub files_fetched: usize,
    pub bytes_fetched: u64,
    pub fetch_batches: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub stream: String,
    pub change: u32,
    pub files_in_snapshot: usize,
    pub removed: RemoveStats,
    pub added: AddStats,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PopulateStats {
    pub streams: Vec<SyncStats>,
    /// Bytes of distinct content across every stream.
    pub total_bytes: u64,
    /// Bytes of content present in every stream.
    pub shared_bytes: u64,
    /// Cached blobs dropped because no stream references them.
    pub cache_files_evicted: usize,
}

/// Content overlap between streams, as reported by [`Repository::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub streams: Vec<String>,
    /// `unique_bytes[row][col]`: bytes of content in stream `row` that
    /// stream `col` does not have.
    pub unique_bytes: Vec<Vec<u64>>,
}

impl StreamStats {
    /// Render the matrix as a table of megabytes.
    pub fn to_table(&self) -> Vec<String> {
        let mut cells: Vec<Vec<String>> = Vec::with_capacity(self.streams.len() + 1);
        cells.push(
            std::iter::once(String::new())
                .chain(self.streams.iter().cloned())
                .collect(),
        );
        for (stream, row) in self.streams.iter().zip(&self.unique_bytes) {
            cells.push(
                std::iter::once(stream.clone())
                    .chain(
                        row.iter()
                            .map(|bytes| format!("{:.1}mb", *bytes as f64 / (1024.0 * 1024.0))),
                    )
                    .collect(),
            );
        }

        let columns = self.streams.len() + 1;
        let widths: Vec<usize> = (0..columns)
            .map(|col| cells.iter().map(|row| row[col].len()).max().unwrap_or(0))
            .collect();
        cells
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&widths)
                    .map(|(cell, width)| format!("{:>width$} | ", cell, width = width))
                    .collect::<String>()
            })
            .collect()
    }
}

/// Files fetched together in one request.
#[derive(Debug)]
struct FetchBatch {
    requests: Vec<FetchRequest>,
    targets: Vec<String>,
    bytes: u64,
}

/// Split `files` into batches of at most `max_batch_bytes`. A file larger
/// than the limit gets a batch of its own.
fn make_batches(files: Vec<SyncFile>, max_batch_bytes: u64, workspace_dir: &Path) -> Vec<FetchBatch> {
    let mut batches = Vec::new();
    let mut current = FetchBatch {
        requests: Vec::new(),
        targets: Vec::new(),
        bytes: 0,
    };
    for file in files {
        let length = file.stream_file.length;
        if !current.requests.is_empty() && current.bytes.saturating_add(length) > max_batch_bytes {
            batches.push(std::mem::replace(
                &mut current,
                FetchBatch {
                    requests: Vec::new(),
                    targets: Vec::new(),
                    bytes: 0,
                },
            ));
        }
        current.requests.push(FetchRequest {
            depot_path: file.stream_file.path,
            revision: file.stream_file.revision,
            local_path: workspace_dir.join(&file.target),
        });
        current.targets.push(file.target);
        current.bytes += length;
    }
    if !current.requests.is_empty() {
        batches.push(current);
    }
    batches
}

/// Rename `source` to `target`, replacing whatever is at `target`.
fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    stamp::remove_file(target)?;
    fs::rename(source, target)
}

fn copy_file(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    stamp::remove_file(target)?;
    fs::copy(source, target).map(|_| ())
}

/// Name under which a synced snapshot is kept in the snapshot store.
fn snapshot_name(stream: &str, change: u32, view: &[String]) -> String {
    if view.is_empty() {
        format!("{}@{}", stream, change)
    } else {
        let view_hash = Hash::hash_bytes(view.join("\n").as_bytes());
        format!("{}@{}?{}", stream, change, &view_hash.to_hex()[..16])
    }
}

impl Repository {
    /// Point `client` at `stream`, unless this repository already did.
    fn ensure_client(&mut self, vcs: &dyn Vcs, client: &str, stream: &str) -> Result<()> {
        if self.created_clients.get(client).map(String::as_str) == Some(stream) {
            return Ok(());
        }
        let start = Instant::now();
        vcs.update_client(client, stream, self.workspace_dir())?;
        self.created_clients
            .insert(client.to_string(), stream.to_string());
        debug!(
            "Updated client {} for {} ({:.1}s)",
            client,
            stream,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Configure `client` for `stream`.
    pub fn setup(&mut self, vcs: &dyn Vcs, client: &str, stream: &str) -> Result<()> {
        self.ensure_client(vcs, client, stream)
    }

    pub fn delete_client(&mut self, vcs: &dyn Vcs, client: &str) -> Result<()> {
        vcs.delete_client(client)?;
        self.created_clients.remove(client);
        Ok(())
    }

    /// Discard pending server-side work for `client`.
    pub fn revert(&mut self, vcs: &dyn Vcs, client: &str) -> Result<()> {
        let start = Instant::now();
        info!("Reverting changes in {}...", client);
        vcs.revert(client)?;
        info!("Completed in {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Build a snapshot of `view` at `change` from a metadata query.
    fn query_snapshot(
        &self,
        vcs: &dyn Vcs,
        client: &str,
        change: u32,
        view: &[String],
    ) -> Result<MemorySnapshot> {
        let start = Instant::now();
        let mut builder = StreamTreeBuilder::new();
        vcs.query_files(client, change, view, &mut |record| {
            self.cancel.check()?;
            builder.add_file(&record.client_path, record.to_stream_file())
        })?;
        let file_count = builder.file_count();
        let snapshot = MemorySnapshot::from_builder(builder);
        info!(
            "Found {} files in change {} ({} nodes, {:.1}s)",
            file_count,
            change,
            snapshot.node_count(),
            start.elapsed().as_secs_f64()
        );
        Ok(snapshot)
    }

    /// Obtain the target snapshot for a sync, from the shared cache file,
    /// the snapshot store, or a fresh query.
    fn resolve_snapshot(
        &self,
        vcs: &dyn Vcs,
        request: &SyncRequest,
        change: u32,
    ) -> Result<Box<dyn StreamSnapshot>> {
        if let Some(cache_file) = &request.snapshot_cache {
            match MemorySnapshot::load(cache_file)? {
                Some(snapshot) if snapshot.root().base_path == request.stream => {
                    return Ok(Box::new(snapshot));
                }
                Some(_) => warn!(
                    "Snapshot cache {} is for a different stream; querying",
                    cache_file.display()
                ),
                None => {}
            }
            let snapshot = self.query_snapshot(vcs, &request.client, change, &request.view)?;
            snapshot.save(cache_file)?;
            return Ok(Box::new(snapshot));
        }

        if let Some(store) = self.snapshot_store() {
            let name = snapshot_name(&request.stream, change, &request.view);
            if let Some(stored) = StoredSnapshot::open(store.clone(), &name)? {
                info!("Using stored snapshot {}", name);
                return Ok(Box::new(stored));
            }
            let snapshot = self.query_snapshot(vcs, &request.client, change, &request.view)?;
            store.import(&name, &snapshot)?;
            return Ok(Box::new(snapshot));
        }

        Ok(Box::new(self.query_snapshot(
            vcs,
            &request.client,
            change,
            &request.view,
        )?))
    }

    /// Switch the workspace to a stream at a change.
    pub fn sync(&mut self, vcs: &dyn Vcs, request: &SyncRequest) -> Result<SyncStats> {
        let start = Instant::now();
        match request.change {
            Some(change) => info!("Syncing to {} at change {}", request.stream, change),
            None => info!("Syncing to {} at latest", request.stream),
        }
        self.run_repair_if_needed()?;
        self.cancel.check()?;

        self.ensure_client(vcs, &request.client, &request.stream)?;
        let change = match request.change {
            Some(change) => change,
            None => vcs.latest_change(&request.stream)?,
        };
        vcs.revert(&request.client)?;

        let (have_table, clean) = rayon::join(
            || vcs.update_have_table(&request.client, change, &request.view),
            || self.clean_internal(request.remove_untracked),
        );
        have_table?;
        clean?;

        self.cancel.check()?;
        let snapshot = self.resolve_snapshot(vcs, request, change)?;
        let files_in_snapshot = snapshot.file_count();

        self.cancel.check()?;
        let removed = self.remove_files_from_workspace(snapshot.as_ref())?;
        let added = self.add_files_to_workspace(vcs, &request.client, snapshot.as_ref())?;

        let elapsed_secs = start.elapsed().as_secs_f64();
        info!("Completed in {:.1}s", elapsed_secs);
        Ok(SyncStats {
            stream: request.stream.clone(),
            change,
            files_in_snapshot,
            removed,
            added,
            elapsed_secs,
        })
    }

    /// Take every staged file that `snapshot` does not want out of the
    /// workspace. Content the cache does not have yet is moved into it.
    pub(crate) fn remove_files_from_workspace(
        &mut self,
        snapshot: &dyn StreamSnapshot,
    ) -> Result<RemoveStats> {
        let start = Instant::now();
        let tx = RemoveTransaction::new(&self.workspace, snapshot, &self.cache)?;
        debug!(
            "Removal compared {} directories",
            tx.directories_visited
        );
        if tx.is_empty() {
            self.workspace = tx.new_workspace;
            return Ok(RemoveStats::default());
        }

        let workspace_dir = self.workspace_dir().to_path_buf();
        let moves: Vec<(PathBuf, PathBuf, FileContentId)> = tx
            .files_to_move_to_cache
            .iter()
            .map(|removed| {
                let entry = self
                    .cache
                    .register(removed.file.content_id.clone(), removed.file.stamp());
                (
                    workspace_dir.join(&removed.path),
                    self.cache.path_of(&entry),
                    entry.content_id,
                )
            })
            .collect();
        self.cache.advance_sequence();
        self.save(RepositoryState::Dirty)?;

        let failed: Vec<FileContentId> = moves
            .par_iter()
            .filter_map(|(source, target, content_id)| match move_file(source, target) {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        "Unable to move {} to cache: {}",
                        source.display(),
                        e
                    );
                    if let Err(e) = stamp::remove_file(source) {
                        warn!("Unable to delete {}: {}", source.display(), e);
                    }
                    Some(content_id.clone())
                }
            })
            .collect();
        if !failed.is_empty() {
            self.requires_repair = true;
            for content_id in &failed {
                self.cache.take(content_id);
            }
        }

        let files: Vec<PathBuf> = tx
            .files_to_delete
            .iter()
            .map(|removed| workspace_dir.join(&removed.path))
            .collect();
        let directories: Vec<PathBuf> = tx
            .directories_to_delete
            .iter()
            .map(|dir| workspace_dir.join(dir))
            .collect();
        let deleted = self.delete_paths(&files, &directories);

        self.workspace = tx.new_workspace;
        self.save(RepositoryState::Clean)?;

        let stats = RemoveStats {
            files_deleted: deleted.files_deleted,
            files_moved_to_cache: moves.len() - failed.len(),
            directories_deleted: deleted.directories_deleted,
            delete_failures: deleted.failed,
        };
        info!(
            "Removed {} files ({} moved to cache, {} deleted, {} failed) in {:.1}s",
            stats.files_moved_to_cache + stats.files_deleted,
            stats.files_moved_to_cache,
            stats.files_deleted,
            stats.delete_failures,
            start.elapsed().as_secs_f64()
        );
        Ok(stats)
    }

    fn check_free_space(&self, required: u64) -> Result<()> {
        let available = fs4::available_space(self.workspace_dir())?;
        let needed = required.saturating_add(self.config.min_scratch_space);
        if available < needed {
            return Err(Error::InsufficientSpace {
                path: self.workspace_dir().to_path_buf(),
                required: needed,
                available,
            });
        }
        Ok(())
    }

    /// Stage every file `snapshot` needs that is not already staged.
    pub(crate) fn add_files_to_workspace(
        &mut self,
        vcs: &dyn Vcs,
        client: &str,
        snapshot: &dyn StreamSnapshot,
    ) -> Result<AddStats> {
        let start = Instant::now();
        let tx = AddTransaction::new(&self.workspace, snapshot, &self.cache)?;
        debug!("Addition compared {} directories", tx.directories_visited);
        if tx.is_empty() {
            self.workspace = tx.new_workspace;
            self.save(RepositoryState::Clean)?;
            return Ok(AddStats::default());
        }

        let required = tx.bytes_to_sync();
        if required > 0 {
            self.check_free_space(required)?;
        }

        let AddTransaction {
            new_workspace,
            files_to_copy,
            files_to_move_from_cache,
            mut files_to_sync,
            ..
        } = tx;
        self.workspace = new_workspace;
        self.save(RepositoryState::Dirty)?;

        let workspace_dir = self.workspace_dir().to_path_buf();
        let mut stats = AddStats::default();
        let mut staged: Vec<String> = Vec::new();

        // Moves first: copies may read from their targets.
        let cache = &self.cache;
        let move_results: Vec<io::Result<()>> = files_to_move_from_cache
            .par_iter()
            .map(|file| move_file(&cache.path_of(&file.entry), &workspace_dir.join(&file.target)))
            .collect();
        for (file, result) in files_to_move_from_cache.into_iter().zip(move_results) {
            let blob = self.cache.path_of(&file.entry);
            self.cache.take(&file.entry.content_id);
            match result {
                Ok(()) => {
                    stats.files_moved_from_cache += 1;
                    staged.push(file.target);
                }
                Err(e) => {
                    warn!(
                        "Unable to move {} from cache to {}: {}. Syncing instead.",
                        file.entry.relative_path().display(),
                        file.target,
                        e
                    );
                    if let Err(e) = stamp::remove_file(&blob) {
                        warn!("Unable to delete {}: {}", blob.display(), e);
                    }
                    self.requires_repair = true;
                    files_to_sync.push(SyncFile {
                        target: file.target,
                        stream_file: file.stream_file,
                    });
                }
            }
        }

        let copy_results: Vec<io::Result<()>> = files_to_copy
            .par_iter()
            .map(|file| copy_file(&workspace_dir.join(&file.source), &workspace_dir.join(&file.target)))
            .collect();
        for (file, result) in files_to_copy.into_iter().zip(copy_results) {
            match result {
                Ok(()) => {
                    stats.files_copied += 1;
                    staged.push(file.target);
                }
                Err(e) => {
                    warn!(
                        "Unable to copy {} to {}: {}. Syncing instead.",
                        file.source, file.target, e
                    );
                    self.requires_repair = true;
                    files_to_sync.push(SyncFile {
                        target: file.target,
                        stream_file: file.stream_file,
                    });
                }
            }
        }

        for target in &staged {
            self.record_metadata(target)?;
        }
        self.cancel.check()?;

        let batches = make_batches(files_to_sync, self.config.max_batch_bytes, &workspace_dir);
        if !batches.is_empty() {
            let (files, bytes) = self.fetch_batches(vcs, client, &batches)?;
            stats.files_fetched = files;
            stats.bytes_fetched = bytes;
            stats.fetch_batches = batches.len();
        }

        self.save(RepositoryState::Clean)?;
        info!(
            "Added {} files ({} moved from cache, {} copied, {} fetched in {} batches, {} bytes) in {:.1}s",
            stats.files_moved_from_cache + stats.files_copied + stats.files_fetched,
            stats.files_moved_from_cache,
            stats.files_copied,
            stats.files_fetched,
            stats.fetch_batches,
            stats.bytes_fetched,
            start.elapsed().as_secs_f64()
        );
        Ok(stats)
    }

    /// Re-stat a freshly staged file. A file that vanished flags the
    /// repository for repair.
    fn record_metadata(&mut self, target: &str) -> Result<()> {
        let workspace_dir = self.workspace_dir().to_path_buf();
        if !self.workspace.update_metadata(&workspace_dir, target)? {
            warn!("Staged file {} is missing", target);
            self.requires_repair = true;
        }
        Ok(())
    }

    /// Run fetch batches on a pool of `sync_threads` workers. This thread
    /// records each batch as it completes and checkpoints periodically.
    fn fetch_batches(
        &mut self,
        vcs: &dyn Vcs,
        client: &str,
        batches: &[FetchBatch],
    ) -> Result<(usize, u64)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.sync_threads)
            .build()
            .map_err(|e| Error::Io {
                source: io::Error::other(format!("failed to start fetch workers: {}", e)),
            })?;

        let cancel = self.cancel.clone();
        let abort = AtomicBool::new(false);
        let checkpoint_interval = self.config.checkpoint_interval;
        let (sender, receiver) = crossbeam::channel::unbounded::<(usize, Option<Result<()>>)>();

        let mut files = 0;
        let mut bytes = 0;
        let mut first_error: Option<Error> = None;
        let mut last_checkpoint = Instant::now();

        pool.in_place_scope(|scope| {
            for (index, batch) in batches.iter().enumerate() {
                let sender = sender.clone();
                let cancel = &cancel;
                let abort = &abort;
                scope.spawn(move |_| {
                    let result = if abort.load(Ordering::SeqCst) {
                        None
                    } else {
                        Some(cancel.check().and_then(|()| vcs.fetch(client, &batch.requests)))
                    };
                    // The receiver outlives every task.
                    let _ = sender.send((index, result));
                });
            }
            drop(sender);

            for (index, result) in receiver.iter() {
                let batch = &batches[index];
                match result {
                    Some(Ok(())) => {
                        files += batch.requests.len();
                        bytes += batch.bytes;
                        debug!(
                            "Fetched batch {} ({} files, {} bytes)",
                            index,
                            batch.requests.len(),
                            batch.bytes
                        );
                        let recorded = batch
                            .targets
                            .iter()
                            .try_for_each(|target| self.record_metadata(target));
                        if let Err(e) = recorded {
                            abort.store(true, Ordering::SeqCst);
                            first_error.get_or_insert(e);
                        } else if last_checkpoint.elapsed() >= checkpoint_interval {
                            if let Err(e) = self.save(RepositoryState::Dirty) {
                                abort.store(true, Ordering::SeqCst);
                                first_error.get_or_insert(e);
                            }
                            last_checkpoint = Instant::now();
                        }
                    }
                    Some(Err(e)) => {
                        abort.store(true, Ordering::SeqCst);
                        first_error.get_or_insert(e);
                    }
                    None => {}
                }
            }
        });

        if let Some(e) = first_error {
            if !e.is_cancelled() {
                self.requires_repair = true;
            }
            self.save(RepositoryState::Dirty)?;
            return Err(e);
        }
        Ok((files, bytes))
    }

    /// Sync several streams in turn so content shared between them is
    /// fetched once, and drop cached content none of them reference.
    pub fn populate(&mut self, vcs: &dyn Vcs, requests: &[PopulateRequest]) -> Result<PopulateStats> {
        self.run_repair_if_needed()?;
        self.clean(true)?;

        let mut states: Vec<(u32, MemorySnapshot)> = Vec::with_capacity(requests.len());
        for request in requests {
            self.cancel.check()?;
            info!("Finding contents of {}:", request.stream);
            self.delete_client(vcs, &request.client)?;
            self.ensure_client(vcs, &request.client, &request.stream)?;
            let change = vcs.latest_change(&request.stream)?;
            info!("Latest change is {}", change);
            vcs.update_have_table(&request.client, change, &request.view)?;
            let snapshot = self.query_snapshot(vcs, &request.client, change, &request.view)?;
            states.push((change, snapshot));
        }

        // Anything the first stream does not want can then be purged from
        // the cache below.
        if let Some((_, first)) = states.first() {
            self.remove_files_from_workspace(first)?;
        }

        let mut lengths: HashMap<FileContentId, u64> = HashMap::new();
        let mut common: Option<HashSet<FileContentId>> = None;
        for (_, snapshot) in &states {
            let mut ids = HashSet::new();
            for item in snapshot::files(snapshot) {
                let (_, file) = item?;
                lengths.insert(file.content_id.clone(), file.length);
                ids.insert(file.content_id);
            }
            common = Some(match common {
                None => ids,
                Some(common) => common.intersection(&ids).cloned().collect(),
            });
        }

        self.save(RepositoryState::Dirty)?;
        let evicted = self.cache.retain(|content_id| lengths.contains_key(content_id))?;
        self.save(RepositoryState::Clean)?;

        let total_bytes: u64 = lengths.values().sum();
        let shared_bytes: u64 = common
            .iter()
            .flatten()
            .filter_map(|content_id| lengths.get(content_id))
            .sum();
        info!(
            "{} bytes total, {} bytes differences, {} cached files evicted",
            total_bytes,
            total_bytes - shared_bytes,
            evicted
        );

        let mut streams = Vec::with_capacity(requests.len());
        for (request, (change, snapshot)) in requests.iter().zip(&states) {
            self.cancel.check()?;
            let start = Instant::now();
            info!("Syncing files for {}:", request.stream);
            self.delete_client(vcs, &request.client)?;
            self.ensure_client(vcs, &request.client, &request.stream)?;
            vcs.update_have_table(&request.client, *change, &request.view)?;

            let removed = self.remove_files_from_workspace(snapshot)?;
            let added = self.add_files_to_workspace(vcs, &request.client, snapshot)?;
            streams.push(SyncStats {
                stream: request.stream.clone(),
                change: *change,
                files_in_snapshot: snapshot.file_count(),
                removed,
                added,
                elapsed_secs: start.elapsed().as_secs_f64(),
            });
        }

        self.save(RepositoryState::Clean)?;
        Ok(PopulateStats {
            streams,
            total_bytes,
            shared_bytes,
            cache_files_evicted: evicted,
        })
    }

    /// For every pair of streams, the bytes of content unique to one
    /// relative to the other. Leaves the workspace untouched.
    pub fn stats(
        &mut self,
        vcs: &dyn Vcs,
        client: &str,
        streams: &[String],
        view: &[String],
    ) -> Result<StreamStats> {
        info!("Finding stats for {} streams", streams.len());

        let mut contents: Vec<Vec<(FileContentId, u64)>> = Vec::with_capacity(streams.len());
        for stream in streams {
            self.cancel.check()?;
            info!("Finding contents of {}:", stream);
            self.created_clients.remove(client);
            self.ensure_client(vcs, client, stream)?;
            let change = vcs.latest_change(stream)?;
            info!("Latest change is {}", change);
            vcs.revert(client)?;
            vcs.clear_have_table(client)?;
            vcs.update_have_table(client, change, view)?;

            let snapshot = self.query_snapshot(vcs, client, change, view)?;
            let files = snapshot::files(&snapshot)
                .map(|item| item.map(|(_, file)| (file.content_id, file.length)))
                .collect::<Result<Vec<_>>>()?;
            contents.push(files);
        }

        let sets: Vec<HashSet<&FileContentId>> = contents
            .iter()
            .map(|files| files.iter().map(|(content_id, _)| content_id).collect())
            .collect();
        let unique_bytes: Vec<Vec<u64>> = contents
            .iter()
            .map(|files| {
                sets.iter()
                    .map(|other| {
                        files
                            .iter()
                            .filter(|(content_id, _)| !other.contains(content_id))
                            .map(|(_, length)| length)
                            .sum::<u64>()
                    })
                    .collect()
            })
            .collect();

        let stats = StreamStats {
            streams: streams.to_vec(),
            unique_bytes,
        };
        info!("Each row shows the size of files in a stream which are unique to that stream compared to each column:");
        for line in stats.to_table() {
            info!("{}", line);
        }
        Ok(stats)
    }
}
