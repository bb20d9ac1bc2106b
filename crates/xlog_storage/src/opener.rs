//! Opening segment files as storage backends.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::file::FileBackend;
use std::path::Path;

/// Opens the files that hold WAL segments.
///
/// The WAL writer and reader never construct backends directly; they go
/// through an opener so that tests can inject backends which fail writes,
/// fail syncs or tear a write halfway through.
pub trait SegmentOpener: Send + Sync {
    /// Opens an existing file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;

    /// Creates a new, empty file. Fails if the file already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be created.
    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;
}

/// The default opener, backed by [`FileBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FileOpener;

impl SegmentOpener for FileOpener {
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open_existing(path)?))
    }

    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::create_new(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_opener_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("xlogtemp.1");

        let mut created = FileOpener.create(&path).unwrap();
        created.append(&[7u8; 8]).unwrap();
        created.sync().unwrap();
        drop(created);

        let reopened = FileOpener.open(&path).unwrap();
        assert_eq!(reopened.read_at(0, 8).unwrap(), vec![7u8; 8]);
        assert!(FileOpener.create(&path).is_err());
    }
}
