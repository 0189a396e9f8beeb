//! Core type definitions for StageDB.

use std::fmt;

/// Length value marking an index entry as a tombstone.
///
/// The key keeps its slot but resolves as absent and range scans skip it.
pub const SENTINEL_DELETED: u32 = u32::MAX;

/// Opaque handle to a loaded index.
///
/// Handles are returned by [`crate::Database::load_index`] and carry the
/// key size so writes can be checked without touching the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexHandle {
    id: u16,
    key_size: u8,
}

impl IndexHandle {
    pub(crate) const fn new(id: u16, key_size: u8) -> Self {
        Self { id, key_size }
    }

    /// Returns the index id.
    #[must_use]
    pub const fn id(self) -> u16 {
        self.id
    }

    /// Returns the fixed key width in bytes.
    #[must_use]
    pub const fn key_size(self) -> usize {
        self.key_size as usize
    }
}

impl fmt::Display for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index:{}", self.id)
    }
}

/// Where a value's bytes live in the value files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locator {
    /// Value file id.
    pub file_id: u16,
    /// Byte offset within the file.
    pub offset: u32,
    /// Value length, or [`SENTINEL_DELETED`].
    pub length: u32,
}

impl Locator {
    /// Creates a locator.
    #[must_use]
    pub const fn new(file_id: u16, offset: u32, length: u32) -> Self {
        Self {
            file_id,
            offset,
            length,
        }
    }

    /// Locator for an empty value; it occupies no space.
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(0, 0, 0)
    }

    /// Returns true if this locator is a tombstone.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.length == SENTINEL_DELETED
    }
}

/// A logical database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileRef {
    /// The undo log.
    Log,
    /// The deletion (free space) list.
    Deletion,
    /// Value file `n`.
    Value(u16),
    /// Node file `file` of index `index`.
    Index {
        /// Index id.
        index: u16,
        /// File number within the index.
        file: u16,
    },
}

impl FileRef {
    /// Returns the file name inside the database directory.
    #[must_use]
    pub fn file_name(self) -> String {
        match self {
            Self::Log => "log.dat".to_string(),
            Self::Deletion => "del.dat".to_string(),
            Self::Value(n) => format!("val_{n}.dat"),
            Self::Index { index, file } => format!("idx_{index}_{file}.dat"),
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}
