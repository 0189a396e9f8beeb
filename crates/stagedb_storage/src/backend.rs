//! Storage backend trait definition.

use crate::error::StorageResult;

/// A random-access byte file used by the StageDB engine.
///
/// Backends are **opaque byte stores**. The engine overwrites value ranges
/// and index nodes in place, extends files with new ones, and cuts files
/// back during recovery, so every write is positioned.
///
/// # Invariants
///
/// - `write_at` past the current end extends the file, zero-filling any gap
/// - `read_at` returns exactly the bytes most recently written at that offset
/// - `sync` makes every prior write durable
/// - Backends must be `Send + Sync` for concurrent access
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends beyond the current size or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, replacing whatever was there.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes buffered writes to the operating system.
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

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Recovery uses this to cut files back to their pre-commit length.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails or `new_size` is greater
    /// than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
