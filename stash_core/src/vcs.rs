//! The boundary to the version control server.

use crate::content::FileContentId;
use crate::error::Result;
use crate::hash::Hash;
use crate::snapshot::StreamFile;
use std::path::{Path, PathBuf};

/// Metadata for one file of a stream at a change, as reported by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// `/`-separated path relative to the workspace root.
    pub client_path: String,
    pub depot_path: String,
    pub length: u64,
    pub digest: Hash,
    pub file_type: String,
    pub revision: i32,
}

impl FileRecord {
    pub fn content_id(&self) -> FileContentId {
        FileContentId::new(self.digest, self.file_type.clone())
    }

    pub fn to_stream_file(&self) -> StreamFile {
        StreamFile {
            path: self.depot_path.clone(),
            length: self.length,
            content_id: self.content_id(),
            revision: self.revision,
        }
    }
}

/// One file to write to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub depot_path: String,
    pub revision: i32,
    pub local_path: PathBuf,
}

/// Operations the sync engine needs from the version control server.
///
/// Implementations report failures as [`crate::Error::Vcs`]. `fetch` may be
/// called from several worker threads at once.
pub trait Vcs: Send + Sync {
    /// Create or update `client` so it maps `stream` onto `root`.
    fn update_client(&self, client: &str, stream: &str, root: &Path) -> Result<()>;

    fn delete_client(&self, client: &str) -> Result<()>;

    /// The most recent submitted change in `stream`.
    fn latest_change(&self, stream: &str) -> Result<u32>;

    /// Discard any pending work recorded against `client`.
    fn revert(&self, client: &str) -> Result<()>;

    /// Forget every file the server believes `client` has.
    fn clear_have_table(&self, client: &str) -> Result<()>;

    /// Record that `client` has every file of `view` at `change`.
    fn update_have_table(&self, client: &str, change: u32, view: &[String]) -> Result<()>;

    /// Report metadata for every file of `view` at `change`.
    fn query_files(
        &self,
        client: &str,
        change: u32,
        view: &[String],
        sink: &mut dyn FnMut(FileRecord) -> Result<()>,
    ) -> Result<()>;

    /// Write each requested revision to its local path.
    fn fetch(&self, client: &str, requests: &[FetchRequest]) -> Result<()>;
}
