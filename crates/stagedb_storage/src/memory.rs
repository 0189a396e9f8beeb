//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory storage backend.
///
/// The byte buffer sits behind an `Arc`, so [`InMemoryBackend::share`]
/// hands out a second backend over the same bytes. Tests use this to
/// "reopen" a file after simulating a crash.
///
/// # Example
///
/// ```rust
/// use stagedb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.write_at(0, b"test data").unwrap();
/// assert_eq!(backend.share().size().unwrap(), 9);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns another backend over the same underlying bytes.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        if new_data.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + new_data.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(new_data);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;

        if new_size > size {
            return Err(StorageError::TruncateGrow { new_size, size });
        }

        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn memory_write_at_overwrites_and_extends() {
        let mut backend = InMemoryBackend::with_data(b"0123456789".to_vec());
        backend.write_at(2, b"AB").unwrap();
        assert_eq!(backend.data(), b"01AB456789");

        backend.write_at(12, b"X").unwrap();
        assert_eq!(backend.size().unwrap(), 13);
        assert_eq!(backend.read_at(10, 3).unwrap(), b"\0\0X");
    }

    #[test]
    fn memory_shared_view_sees_writes() {
        let mut backend = InMemoryBackend::new();
        let view = backend.share();
        backend.write_at(0, b"abc").unwrap();
        assert_eq!(view.data(), b"abc");
    }

    #[test]
    fn memory_truncate() {
        let mut backend = InMemoryBackend::with_data(b"hello world".to_vec());
        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");
        assert!(matches!(
            backend.truncate(6),
            Err(StorageError::TruncateGrow { .. })
        ));
    }

    #[test]
    fn memory_read_past_end_fails() {
        let backend = InMemoryBackend::with_data(vec![1, 2, 3]);
        assert!(matches!(
            backend.read_at(2, 2),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    proptest! {
        #[test]
        fn writes_match_vec_model(ops in prop::collection::vec((0u64..64, prop::collection::vec(any::<u8>(), 0..16)), 1..32)) {
            let mut backend = InMemoryBackend::new();
            let mut model: Vec<u8> = Vec::new();
            for (offset, bytes) in ops {
                backend.write_at(offset, &bytes).unwrap();
                if !bytes.is_empty() {
                    let end = offset as usize + bytes.len();
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[offset as usize..end].copy_from_slice(&bytes);
                }
            }
            prop_assert_eq!(backend.data(), model);
        }
    }
}
