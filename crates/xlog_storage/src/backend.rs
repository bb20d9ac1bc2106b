//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level positional storage backend.
///
/// Storage backends are **opaque byte stores**. The WAL manager writes
/// whole pages at fixed offsets inside preallocated segment files, so unlike
/// a pure log the backend supports positional writes as well as appends.
///
/// # Invariants
///
/// - `write_at` never leaves a gap: `offset` must be `<= size()`
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` ensures all written data and metadata is durable
/// - `sync_data` ensures written data is durable (metadata may lag)
/// - Backends must be `Send + Sync` for concurrent access
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, extending the storage if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is past the current end or an I/O error
    /// occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Syncs file data to durable storage without forcing a metadata update.
    ///
    /// The default implementation falls back to [`StorageBackend::sync`].
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync_data(&mut self) -> StorageResult<()> {
        self.sync()
    }

    /// Truncates the storage to the given size.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size or
    /// the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
