//! Open file handles for one database.

use crate::dir::FileOpener;
use crate::error::{CoreError, CoreResult};
use crate::types::FileRef;
use stagedb_storage::StorageBackend;
use std::collections::HashMap;
use std::sync::Arc;

/// Table of open backends keyed by logical file.
///
/// Reads take `&self` and only reach files opened earlier, which lets
/// readers share the table behind a read lock. Writes open files lazily.
pub(crate) struct FileSet {
    opener: Arc<dyn FileOpener>,
    open: HashMap<FileRef, Box<dyn StorageBackend>>,
}

impl FileSet {
    pub(crate) fn new(opener: Arc<dyn FileOpener>) -> Self {
        Self {
            opener,
            open: HashMap::new(),
        }
    }

    pub(crate) fn opener(&self) -> &Arc<dyn FileOpener> {
        &self.opener
    }

    pub(crate) fn exists(&self, file: FileRef) -> bool {
        self.open.contains_key(&file) || self.opener.exists(file)
    }

    /// Opens `file` if it is not open yet.
    pub(crate) fn ensure_open(&mut self, file: FileRef) -> CoreResult<()> {
        self.backend_mut(file).map(|_| ())
    }

    fn backend(&self, file: FileRef) -> CoreResult<&dyn StorageBackend> {
        self.open
            .get(&file)
            .map(|b| b.as_ref())
            .ok_or_else(|| CoreError::corruption(format!("{file} is referenced but not open")))
    }

    fn backend_mut(&mut self, file: FileRef) -> CoreResult<&mut Box<dyn StorageBackend>> {
        if !self.open.contains_key(&file) {
            let backend = self.opener.open(file)?;
            self.open.insert(file, backend);
        }
        self.open
            .get_mut(&file)
            .ok_or_else(|| CoreError::corruption(format!("{file} could not be opened")))
    }

    pub(crate) fn read(&self, file: FileRef, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.backend(file)?.read_at(offset, len)?)
    }

    /// Reads the whole file, opening it first.
    pub(crate) fn read_all(&mut self, file: FileRef) -> CoreResult<Vec<u8>> {
        let backend = self.backend_mut(file)?;
        let size = backend.size()?;
        let len = usize::try_from(size)
            .map_err(|_| CoreError::corruption(format!("{file} is too large to load")))?;
        Ok(backend.read_at(0, len)?)
    }

    /// Returns the current size, or 0 for a file that does not exist.
    pub(crate) fn size(&mut self, file: FileRef) -> CoreResult<u64> {
        if !self.exists(file) {
            return Ok(0);
        }
        Ok(self.backend_mut(file)?.size()?)
    }

    pub(crate) fn write(&mut self, file: FileRef, offset: u64, data: &[u8]) -> CoreResult<()> {
        self.backend_mut(file)?.write_at(offset, data)?;
        Ok(())
    }

    pub(crate) fn truncate(&mut self, file: FileRef, size: u64) -> CoreResult<()> {
        let backend = self.backend_mut(file)?;
        if backend.size()? > size {
            backend.truncate(size)?;
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self, file: FileRef) -> CoreResult<()> {
        let backend = self.backend_mut(file)?;
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }

    /// Closes and deletes `file`.
    pub(crate) fn remove(&mut self, file: FileRef) -> CoreResult<()> {
        self.open.remove(&file);
        self.opener.remove(file)
    }

    /// Flushes every open file.
    pub(crate) fn flush_all(&mut self) -> CoreResult<()> {
        for backend in self.open.values_mut() {
            backend.flush()?;
        }
        Ok(())
    }
}
