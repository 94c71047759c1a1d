//! Error types for stash_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using stash_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing a repository.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// On-disk metadata no longer matches what was recorded.
    #[error("Integrity check failed for {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    /// Not enough free space on the workspace volume to fetch pending files.
    #[error(
        "Insufficient space on {path}: {required} bytes required, {available} bytes available"
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// The version control collaborator reported a failure.
    #[error("VCS error: {reason}")]
    Vcs { reason: String },

    /// Repository is missing or not initialized.
    #[error("Invalid repository at {path}: {reason}")]
    InvalidRepository { path: PathBuf, reason: String },

    /// Repository is held by another process.
    #[error("Repository at {path} is locked by another process")]
    RepositoryLocked { path: PathBuf },

    /// A persisted file was written by an unknown format version.
    #[error("Unsupported {what} version: {version}")]
    UnsupportedVersion { what: String, version: i64 },

    /// Persisted state could not be decoded.
    #[error("Corrupted state: {reason}")]
    CorruptedState { reason: String },

    /// Snapshot object file is corrupted or invalid.
    #[error("Corrupted object at {path}: {reason}")]
    CorruptedObject { path: PathBuf, reason: String },

    /// Snapshot object not found.
    #[error("Object not found: {hash}")]
    ObjectNotFound { hash: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Path could not be mapped into the workspace or depot.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Configuration file contains a bad value.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Operation was cancelled between phases.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an Integrity error.
    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a Vcs error.
    pub fn vcs(reason: impl Into<String>) -> Self {
        Error::Vcs {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRepository error.
    pub fn invalid_repository(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidRepository {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedVersion error.
    pub fn unsupported_version(what: impl Into<String>, version: i64) -> Self {
        Error::UnsupportedVersion {
            what: what.into(),
            version,
        }
    }

    /// Create a CorruptedState error.
    pub fn corrupted_state(reason: impl Into<String>) -> Self {
        Error::CorruptedState {
            reason: reason.into(),
        }
    }

    /// Create a CorruptedObject error.
    pub fn corrupted_object(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(hash: impl Into<String>) -> Self {
        Error::ObjectNotFound { hash: hash.into() }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True if the operation stopped at a cancellation check.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
