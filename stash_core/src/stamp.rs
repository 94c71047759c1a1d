//! File metadata used to detect drift between recorded and on-disk state.

use crate::error::Result;
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// The subset of file metadata that is recorded for every staged or cached
/// file. A file whose stamp differs from its record is no longer trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub length: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub last_modified: i64,
    pub read_only: bool,
}

impl FileStamp {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_nanos() as i64)
            .unwrap_or(0);

        Self {
            length: metadata.len(),
            last_modified,
            read_only: metadata.permissions().readonly(),
        }
    }

    /// Stat a path. Returns `None` if it does not exist or is not a file.
    pub fn of(path: &Path) -> Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(Self::from_metadata(&metadata))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Delete a file, clearing the read-only attribute first if that blocks it.
/// A file that is already gone is not an error.
pub fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            set_read_only(path, false)?;
            fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}

/// Set or clear the read-only attribute.
pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    if permissions.readonly() != read_only {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(read_only);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stamp_of_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(FileStamp::of(&temp_dir.path().join("missing")).unwrap(), None);
        // Directories are not files.
        assert_eq!(FileStamp::of(temp_dir.path()).unwrap(), None);
    }

    #[test]
    fn test_stamp_tracks_length_and_read_only() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        fs::write(&path, b"12345").unwrap();

        let stamp = FileStamp::of(&path).unwrap().unwrap();
        assert_eq!(stamp.length, 5);
        assert!(!stamp.read_only);
        assert!(stamp.last_modified > 0);

        set_read_only(&path, true).unwrap();
        assert!(FileStamp::of(&path).unwrap().unwrap().read_only);
    }

    #[test]
    fn test_remove_read_only_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("locked.bin");
        fs::write(&path, b"x").unwrap();
        set_read_only(&path, true).unwrap();

        remove_file(&path).unwrap();
        assert!(!path.exists());

        // Second removal is a no-op.
        remove_file(&path).unwrap();
    }
}
