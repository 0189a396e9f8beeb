//! Database directory management.
//!
//! A database lives in one directory:
//!
//! ```text
//! <path>/<name>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ log.dat           # Undo log
//! ├─ del.dat           # Deletion (free space) list
//! ├─ val_<n>.dat       # Value files, val_0 carries the header and extra data
//! └─ idx_<id>_<n>.dat  # Node files per index
//! ```
//!
//! The engine reaches files through [`FileOpener`], so the same code runs
//! against [`DatabaseDir`] on disk and [`MemoryFiles`] in memory.

use crate::error::{CoreError, CoreResult};
use crate::types::FileRef;
use fs2::FileExt;
use parking_lot::Mutex;
use stagedb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";

/// Opens and removes the logical files of one database.
pub trait FileOpener: Send + Sync {
    /// Opens `file`, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    fn open(&self, file: FileRef) -> CoreResult<Box<dyn StorageBackend>>;

    /// Returns true if `file` exists.
    fn exists(&self, file: FileRef) -> bool;

    /// Removes `file`. Removing a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, file: FileRef) -> CoreResult<()>;

    /// Creates `file` with `contents` so that it is either absent or complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn create_atomic(&self, file: FileRef, contents: &[u8]) -> CoreResult<()>;

    /// Makes file creations and removals durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be synced.
    fn sync_dir(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// An on-disk database directory holding the exclusive LOCK.
///
/// # Example
///
/// ```rust,ignore
/// use stagedb_core::dir::DatabaseDir;
/// use std::path::Path;
///
/// let dir = DatabaseDir::open(Path::new("data/ledger"), true)?;
/// println!("log: {:?}", dir.file_path(FileRef::Log));
/// ```
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_argument(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of a logical file.
    #[must_use]
    pub fn file_path(&self, file: FileRef) -> PathBuf {
        self.path.join(file.file_name())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals metadata; directories cannot be opened for fsync.
        Ok(())
    }
}

impl FileOpener for DatabaseDir {
    fn open(&self, file: FileRef) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open(&self.file_path(file))?))
    }

    fn exists(&self, file: FileRef) -> bool {
        self.file_path(file).exists()
    }

    fn remove(&self, file: FileRef) -> CoreResult<()> {
        match fs::remove_file(self.file_path(file)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn create_atomic(&self, file: FileRef, contents: &[u8]) -> CoreResult<()> {
        let target = self.file_path(file);
        let temp = self.path.join(format!("{}.tmp", file.file_name()));

        let mut out = File::create(&temp)?;
        out.write_all(contents)?;
        out.sync_all()?;
        drop(out);

        fs::rename(&temp, &target)?;
        self.sync_directory()
    }

    fn sync_dir(&self) -> CoreResult<()> {
        self.sync_directory()
    }
}

/// In-memory database files.
///
/// Clones share the same files, so a test can drop a database and open a
/// new one over the bytes it left behind.
#[derive(Debug, Clone, Default)]
pub struct MemoryFiles {
    files: Arc<Mutex<HashMap<FileRef, InMemoryBackend>>>,
}

impl MemoryFiles {
    /// Creates an empty file set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a file's bytes.
    #[must_use]
    pub fn bytes(&self, file: FileRef) -> Option<Vec<u8>> {
        self.files.lock().get(&file).map(InMemoryBackend::data)
    }

    /// Replaces a file's bytes.
    pub fn set_bytes(&self, file: FileRef, data: Vec<u8>) {
        self.files
            .lock()
            .insert(file, InMemoryBackend::with_data(data));
    }

    /// Returns every file currently present, in name order.
    #[must_use]
    pub fn list(&self) -> Vec<FileRef> {
        let mut files: Vec<FileRef> = self.files.lock().keys().copied().collect();
        files.sort();
        files
    }
}

impl FileOpener for MemoryFiles {
    fn open(&self, file: FileRef) -> CoreResult<Box<dyn StorageBackend>> {
        let mut files = self.files.lock();
        let backend = files.entry(file).or_default();
        Ok(Box::new(backend.share()))
    }

    fn exists(&self, file: FileRef) -> bool {
        self.files.lock().contains_key(&file)
    }

    fn remove(&self, file: FileRef) -> CoreResult<()> {
        self.files.lock().remove(&file);
        Ok(())
    }

    fn create_atomic(&self, file: FileRef, contents: &[u8]) -> CoreResult<()> {
        self.set_bytes(file, contents.to_vec());
        Ok(())
    }
}
