//! The repository: a workspace directory, the content cache beside it, and
//! the persisted state tying them together.
//!
//! Layout under the base directory:
//! - `Repository.sig` marks the directory as a repository
//! - `Repository.dat` holds the cache entries and the workspace tree
//! - `Repository.dat.transaction` is the previous state while a save is in
//!   progress
//! - `config` holds [`RepositoryConfig`]
//! - `Cache/` holds parked blobs
//! - `Sync/` is the workspace that clients map onto
//! - `Snapshots/` holds persisted stream snapshots, if enabled

use crate::cache::{ContentCache, PurgeStats};
use crate::cancel::CancellationFlag;
use crate::codec::{Decoder, Encoder};
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::lock::{LOCK_FILE_NAME, RepositoryLock};
use crate::snapshot::{MemorySnapshot, SnapshotStore};
use crate::stamp;
use crate::workspace::WorkspaceDirectory;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const SIGNATURE_FILE_NAME: &str = "Repository.sig";
pub const STATE_FILE_NAME: &str = "Repository.dat";
pub const CONFIG_FILE_NAME: &str = "config";
const TRANSACTION_SUFFIX: &str = ".transaction";
const CACHE_DIR_NAME: &str = "Cache";
const WORKSPACE_DIR_NAME: &str = "Sync";
const SNAPSHOT_DIR_NAME: &str = "Snapshots";

/// Contents of the signature file.
const SIGNATURE: i32 = ((b'S' as i32) << 24) | ((b'T' as i32) << 16) | 1;

/// Version of the state file format.
pub const CURRENT_VERSION: i32 = 1;

/// Whether persisted state can be trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryState {
    Clean,
    /// Written before destructive work begins. Loading a dirty state runs a
    /// repair first.
    Dirty,
}

/// Sizes and local modifications, as reported by [`Repository::status`].
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStatus {
    pub cache_files: usize,
    pub cache_size: u64,
    pub workspace_files: usize,
    pub workspace_size: u64,
    pub requires_repair: bool,
    /// `+path`, `-path` and `!path` entries; see
    /// [`WorkspaceDirectory::find_differences`].
    pub differences: Vec<String>,
}

pub struct Repository {
    base_dir: PathBuf,
    workspace_dir: PathBuf,
    pub(crate) config: RepositoryConfig,
    pub(crate) cache: ContentCache,
    pub(crate) workspace: WorkspaceDirectory,
    /// Set when a file operation failed and recorded state may be wrong.
    pub(crate) requires_repair: bool,
    /// Client name to the stream it was last mapped to by this value.
    pub(crate) created_clients: HashMap<String, String>,
    pub(crate) cancel: CancellationFlag,
    snapshots: Option<Arc<SnapshotStore>>,
    _lock: RepositoryLock,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("base_dir", &self.base_dir)
            .field("cache_files", &self.cache.len())
            .field("workspace_files", &self.workspace.file_count())
            .field("requires_repair", &self.requires_repair)
            .finish()
    }
}

fn transaction_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(TRANSACTION_SUFFIX);
    PathBuf::from(name)
}

/// Move a backup left by an interrupted save back over its target.
fn restore_backup(target: &Path) -> Result<()> {
    let backup = transaction_path(target);
    if backup.exists() {
        warn!(
            "Restoring {} from interrupted save",
            target.display()
        );
        stamp::remove_file(target)?;
        fs::rename(&backup, target)?;
    }
    Ok(())
}

/// Delete everything in `base_dir` except the lock file.
fn wipe_directory(base_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        if entry.file_name() == LOCK_FILE_NAME {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            stamp::remove_file(&entry.path())?;
        }
    }
    Ok(())
}

struct PersistedState {
    config: RepositoryConfig,
    cache: ContentCache,
    workspace: WorkspaceDirectory,
    dirty: bool,
}

/// Outcome of [`Repository::delete_paths`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DeleteCounts {
    pub files_deleted: usize,
    pub directories_deleted: usize,
    pub failed: usize,
}

impl Repository {
    /// Create an empty repository in `base_dir`. Anything already in the
    /// directory is deleted.
    pub fn create(base_dir: &Path, config: RepositoryConfig) -> Result<Self> {
        let lock = RepositoryLock::acquire(base_dir)?;
        Self::create_locked(base_dir, config, lock)
    }

    fn create_locked(base_dir: &Path, config: RepositoryConfig, lock: RepositoryLock) -> Result<Self> {
        info!("Creating repository at {}...", base_dir.display());
        wipe_directory(base_dir)?;

        config.write(&base_dir.join(CONFIG_FILE_NAME))?;
        let repo = Self::from_parts(
            base_dir,
            PersistedState {
                config,
                cache: ContentCache::new(base_dir.join(CACHE_DIR_NAME)),
                workspace: WorkspaceDirectory::default(),
                dirty: false,
            },
            lock,
        )?;
        repo.save(RepositoryState::Clean)?;
        repo.cache.create_hierarchy()?;

        let mut enc = Encoder::new();
        enc.write_i32(SIGNATURE);
        fs::write(base_dir.join(SIGNATURE_FILE_NAME), enc.finish())?;
        Ok(repo)
    }

    /// True if `base_dir` holds a repository with a current signature.
    pub fn exists(base_dir: &Path) -> bool {
        match fs::read(base_dir.join(SIGNATURE_FILE_NAME)) {
            Ok(data) => Decoder::new(&data).read_i32().is_ok_and(|sig| sig == SIGNATURE),
            Err(_) => false,
        }
    }

    /// Open the repository in `base_dir`, restoring an interrupted save and
    /// repairing a dirty state first.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let lock = RepositoryLock::acquire(base_dir)?;
        let state = Self::read_state(base_dir)?;
        Self::open_state(base_dir, state, lock)
    }

    /// Open the repository in `base_dir`, or create one if there is none.
    /// With `overwrite`, a repository that fails to load is recreated.
    pub fn load_or_create(base_dir: &Path, overwrite: bool) -> Result<Self> {
        let lock = RepositoryLock::acquire(base_dir)?;
        if Self::exists(base_dir) {
            match Self::read_state(base_dir) {
                Ok(state) => return Self::open_state(base_dir, state, lock),
                Err(e) if overwrite => warn!("Unable to load existing repository: {}", e),
                Err(e) => return Err(e),
            }
        }
        let config = RepositoryConfig::load(&base_dir.join(CONFIG_FILE_NAME)).unwrap_or_default();
        Self::create_locked(base_dir, config, lock)
    }

    fn read_state(base_dir: &Path) -> Result<PersistedState> {
        if !Self::exists(base_dir) {
            return Err(Error::invalid_repository(base_dir, "no valid repository found"));
        }
        let config = RepositoryConfig::load(&base_dir.join(CONFIG_FILE_NAME))?;

        let state_path = base_dir.join(STATE_FILE_NAME);
        restore_backup(&state_path)?;
        let data = match fs::read(&state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::invalid_repository(base_dir, "state file not found"));
            }
            Err(e) => return Err(e.into()),
        };

        let mut dec = Decoder::new(&data);
        let version = dec.read_i32()?;
        if version != CURRENT_VERSION {
            return Err(Error::unsupported_version("repository", i64::from(version)));
        }
        let dirty = dec.read_bool()?;
        let cache = ContentCache::decode(base_dir.join(CACHE_DIR_NAME), &mut dec)?;
        let workspace = WorkspaceDirectory::decode("", &mut dec)?;
        if !dec.is_empty() {
            return Err(Error::corrupted_state("trailing bytes after workspace"));
        }

        Ok(PersistedState {
            config,
            cache,
            workspace,
            dirty,
        })
    }

    fn open_state(base_dir: &Path, state: PersistedState, lock: RepositoryLock) -> Result<Self> {
        let mut repo = Self::from_parts(base_dir, state, lock)?;
        info!(
            "Loaded repository at {} ({} cached, {} staged)",
            base_dir.display(),
            repo.cache.len(),
            repo.workspace.file_count()
        );
        repo.run_repair_if_needed()?;
        Ok(repo)
    }

    fn from_parts(base_dir: &Path, state: PersistedState, lock: RepositoryLock) -> Result<Self> {
        let workspace_dir = base_dir.join(WORKSPACE_DIR_NAME);
        fs::create_dir_all(&workspace_dir)?;

        let snapshots = if state.config.persist_snapshots {
            Some(Arc::new(SnapshotStore::open_or_init(
                base_dir.join(SNAPSHOT_DIR_NAME),
            )?))
        } else {
            None
        };

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            workspace_dir,
            config: state.config,
            cache: state.cache,
            workspace: state.workspace,
            requires_repair: state.dirty,
            created_clients: HashMap::new(),
            cancel: CancellationFlag::new(),
            snapshots,
            _lock: lock,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The directory files are staged in.
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn workspace(&self) -> &WorkspaceDirectory {
        &self.workspace
    }

    pub fn requires_repair(&self) -> bool {
        self.requires_repair
    }

    pub fn snapshot_store(&self) -> Option<&Arc<SnapshotStore>> {
        self.snapshots.as_ref()
    }

    /// A handle that cancels running operations on this repository.
    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Persist the cache entries and workspace tree.
    ///
    /// The previous state file is kept as a backup until the new one is in
    /// place. If a backup already exists it is the last complete state, so
    /// the target is discarded instead.
    pub(crate) fn save(&self, state: RepositoryState) -> Result<()> {
        let dirty = self.requires_repair || state == RepositoryState::Dirty;

        let mut enc = Encoder::new();
        enc.write_i32(CURRENT_VERSION);
        enc.write_bool(dirty);
        self.cache.encode(&mut enc);
        self.workspace.encode(&mut enc);
        let data = enc.finish();

        let target = self.base_dir.join(STATE_FILE_NAME);
        let backup = transaction_path(&target);
        if backup.exists() {
            stamp::remove_file(&target)?;
        } else if target.exists() {
            fs::rename(&target, &backup)?;
        }

        let mut temp_file = tempfile::NamedTempFile::new_in(&self.base_dir)?;
        temp_file.write_all(&data)?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(&target)?;
        stamp::remove_file(&backup)?;

        debug!(dirty, bytes = data.len(), "Saved repository state");
        Ok(())
    }

    /// Delete files, then directories deepest first. Failures are logged
    /// and flag the repository for repair.
    pub(crate) fn delete_paths(
        &mut self,
        files: &[PathBuf],
        directories: &[PathBuf],
    ) -> DeleteCounts {
        let failed_files = files
            .par_iter()
            .filter(|path| match stamp::remove_file(path) {
                Ok(()) => false,
                Err(e) => {
                    warn!("Unable to delete {}: {}", path.display(), e);
                    true
                }
            })
            .count();

        let directories_len = directories.len();
        let mut directories: Vec<&PathBuf> = directories.iter().collect();
        directories.sort_by(|a, b| {
            b.as_os_str()
                .len()
                .cmp(&a.as_os_str().len())
                .then_with(|| a.cmp(b))
        });
        let mut failed_dirs = 0;
        for dir in directories {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Unable to delete {}: {}", dir.display(), e);
                    failed_dirs += 1;
                }
            }
        }

        if failed_files + failed_dirs > 0 {
            self.requires_repair = true;
        }
        DeleteCounts {
            files_deleted: files.len() - failed_files,
            directories_deleted: directories_len - failed_dirs,
            failed: failed_files + failed_dirs,
        }
    }

    /// Check the cache and the workspace against disk, dropping anything
    /// that no longer matches, and clear the repair flag.
    pub fn repair(&mut self) -> Result<()> {
        let start = Instant::now();
        info!("Checking cache...");

        let evicted = self.cache.verify()?;
        fs::create_dir_all(&self.workspace_dir)?;
        let refresh = self.workspace.refresh(&self.workspace_dir, false)?;
        let dropped = refresh.files_to_delete.len();
        self.delete_paths(&refresh.files_to_delete, &refresh.directories_to_delete);

        self.requires_repair = false;
        self.save(RepositoryState::Clean)?;
        info!(
            evicted,
            dropped,
            "Repair completed in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    pub(crate) fn run_repair_if_needed(&mut self) -> Result<()> {
        if self.requires_repair {
            self.repair()?;
        }
        Ok(())
    }

    /// Bring the workspace tree in line with disk. Modified files are
    /// deleted; untracked files and directories are deleted only if
    /// `remove_untracked` is set.
    pub fn clean(&mut self, remove_untracked: bool) -> Result<()> {
        let start = Instant::now();
        info!("Cleaning workspace...");
        self.clean_internal(remove_untracked)?;
        info!("Completed in {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    pub(crate) fn clean_internal(&mut self, remove_untracked: bool) -> Result<()> {
        self.cancel.check()?;
        fs::create_dir_all(&self.workspace_dir)?;
        let refresh = self.workspace.refresh(&self.workspace_dir, remove_untracked)?;

        if refresh.files_to_delete.is_empty() && refresh.directories_to_delete.is_empty() {
            return Ok(());
        }

        let mut paths: Vec<String> = refresh
            .directories_to_delete
            .iter()
            .map(|dir| format!("{}/...", self.relative(dir)))
            .chain(refresh.files_to_delete.iter().map(|file| self.relative(file)))
            .collect();
        paths.sort();
        for path in &paths {
            info!("  /{}", path);
        }

        self.delete_paths(&refresh.files_to_delete, &refresh.directories_to_delete);
        self.save(RepositoryState::Clean)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Remove every staged file, parking its content in the cache.
    pub fn clear(&mut self) -> Result<()> {
        let start = Instant::now();
        info!("Clearing workspace...");
        self.clean_internal(true)?;
        self.remove_files_from_workspace(&MemorySnapshot::empty())?;
        self.save(RepositoryState::Clean)?;
        info!("Completed in {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Shrink the cache to at most `max_bytes`, evicting oldest first.
    pub fn purge(&mut self, max_bytes: u64) -> Result<PurgeStats> {
        info!("Purging cache (limit {} bytes)...", max_bytes);
        self.save(RepositoryState::Dirty)?;
        let stats = self.cache.purge(max_bytes)?;
        self.save(RepositoryState::Clean)?;
        Ok(stats)
    }

    pub fn status(&self) -> Result<RepositoryStatus> {
        let status = RepositoryStatus {
            cache_files: self.cache.len(),
            cache_size: self.cache.total_size(),
            workspace_files: self.workspace.file_count(),
            workspace_size: self.workspace.total_size(),
            requires_repair: self.requires_repair,
            differences: self.workspace.find_differences(&self.workspace_dir)?,
        };
        info!(
            "Cache contains {} files, {} bytes",
            status.cache_files, status.cache_size
        );
        info!(
            "Stage contains {} files, {} bytes",
            status.workspace_files, status.workspace_size
        );
        if !status.differences.is_empty() {
            info!("Local changes:");
            for difference in &status.differences {
                info!("  {}", difference);
            }
        }
        Ok(status)
    }

    /// Every workspace and cache record, one per line. Also logged at debug
    /// level.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();

        let mut files = self.workspace.files();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        if !files.is_empty() {
            lines.push("Workspace:".to_string());
            for (path, file) in files {
                lines.push(format!(
                    "  {} [{}] [{}] [{}]{}",
                    path,
                    file.content_id,
                    file.length,
                    file.last_modified,
                    if file.read_only { "" } else { " [writable]" }
                ));
            }
        }

        let mut entries: Vec<_> = self.cache.entries().collect();
        entries.sort_by_key(|entry| entry.cache_id);
        if !entries.is_empty() {
            lines.push("Cache:".to_string());
            for entry in entries {
                lines.push(format!(
                    "  {} [{}] [{}] [{}] [seq {}]{}",
                    entry.relative_path().display(),
                    entry.content_id,
                    entry.length,
                    entry.last_modified,
                    entry.sequence_number,
                    if entry.read_only { "" } else { " [writable]" }
                ));
            }
        }

        for line in &lines {
            debug!("{}", line);
        }
        lines
    }
}
