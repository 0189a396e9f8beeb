//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// Reads seek a shared handle, so they are serialized by an internal lock.
///
/// # Example
///
/// ```no_run
/// use stagedb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("val_0.dat")).unwrap();
/// backend.write_at(0, b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock();
        let mut size = self.size.write();

        // Seeking past the end and writing leaves a zero-filled hole.
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size = (*size).max(offset + data.len() as u64);

        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.lock();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::TruncateGrow {
                new_size,
                size: *size,
            });
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("val_0.dat");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn file_extend_then_overwrite() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("f")).unwrap();

        backend.write_at(0, b"hello").unwrap();
        backend.write_at(5, b" world").unwrap();

        backend.write_at(6, b"WORLD").unwrap();
        assert_eq!(backend.read_at(0, 11).unwrap(), b"hello WORLD");
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn file_write_past_end_zero_fills() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("f")).unwrap();
        backend.write_at(0, b"ab").unwrap();

        backend.write_at(5, b"z").unwrap();
        assert_eq!(backend.size().unwrap(), 6);
        assert_eq!(backend.read_at(0, 6).unwrap(), b"ab\0\0\0z");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("f")).unwrap();
        backend.write_at(0, b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_truncate_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.write_at(0, b"persistent data").unwrap();
            backend.truncate(10).unwrap();
            assert!(matches!(
                backend.truncate(11),
                Err(StorageError::TruncateGrow { .. })
            ));
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 10);
        assert_eq!(backend.read_at(0, 10).unwrap(), b"persistent");
    }
}
