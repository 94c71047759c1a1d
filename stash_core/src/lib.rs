//! # Stash Core
//!
//! A content-addressed workspace cache and incremental sync engine for a
//! centralized version control server.
//!
//! A repository owns one workspace directory and a cache of file contents
//! beside it. Switching the workspace between streams only fetches the
//! files that are neither staged in the workspace nor parked in the cache;
//! everything else is moved, copied or kept in place.
//!
//! ## Features
//!
//! - Content identified by BLAKE3 digest and length
//! - Merkle snapshots of streams, so unchanged subtrees are skipped
//! - Two-phase sync (remove then add) with crash-safe state saves
//! - Batched parallel fetches with periodic checkpoints
//! - Cache purging, repair and multi-stream population
//!
//! ## Example
//!
//! ```no_run
//! use stash_core::{LocalDepot, Repository, RepositoryConfig, SyncRequest};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let depot = LocalDepot::new("./depot");
//! let mut repo = Repository::create(Path::new("./stash-repo"), RepositoryConfig::default())?;
//!
//! let stats = repo.sync(
//!     &depot,
//!     &SyncRequest {
//!         client: "build-01".into(),
//!         stream: "//main".into(),
//!         ..SyncRequest::default()
//!     },
//! )?;
//! println!("Fetched {} files", stats.added.files_fetched);
//!
//! // Keep at most 10 GiB of parked content
//! repo.purge(10 * 1024 * 1024 * 1024)?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod cancel;
mod codec;
mod config;
mod content;
mod depot;
mod error;
mod hash;
mod lock;
mod object;
mod repository;
mod snapshot;
mod stamp;
mod sync;
mod transaction;
mod vcs;
mod workspace;

pub use cache::{CachedFileInfo, ContentCache, PurgeStats};
pub use cancel::CancellationFlag;
pub use config::{CONFIG_VERSION, RepositoryConfig};
pub use content::FileContentId;
pub use depot::{LocalDepot, view_matches};
pub use error::{Error, Result};
pub use hash::Hash;
pub use repository::{Repository, RepositoryState, RepositoryStatus};
pub use snapshot::{
    CACHE_FILE_SIGNATURE, CACHE_FILE_VERSION, MemorySnapshot, SnapshotStore, StoredSnapshot, StreamFile, StreamSnapshot, StreamTree,
    StreamTreeBuilder, StreamTreeRef,
};
pub use stamp::FileStamp;
pub use sync::{
    AddStats, PopulateRequest, PopulateStats, RemoveStats, StreamStats, SyncRequest, SyncStats,
};
pub use transaction::{AddTransaction, RemoveTransaction};
pub use vcs::{FetchRequest, FileRecord, Vcs};
pub use workspace::{RefreshResult, WorkspaceDirectory, WorkspaceFile};
