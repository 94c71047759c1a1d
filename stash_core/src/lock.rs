//! Exclusive ownership of a repository directory.

use crate::error::{Error, Result};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Name of the lock file inside the repository base directory.
pub const LOCK_FILE_NAME: &str = "Repository.lock";

/// Holds an exclusive lock on the repository for as long as it lives.
#[derive(Debug)]
pub struct RepositoryLock {
    _file: File,
    path: PathBuf,
}

impl RepositoryLock {
    /// Lock `base_dir`, failing with [`Error::RepositoryLocked`] if another
    /// handle already holds it.
    pub fn acquire(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let path = base_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(Error::RepositoryLocked {
                path: base_dir.to_path_buf(),
            }),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => {
                Err(Error::RepositoryLocked {
                    path: base_dir.to_path_buf(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
