//! Error types for StageDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in StageDB core operations.
///
/// A key that is absent from every tier is not an error; lookups report it
/// through `Option` or `bool`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] stagedb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The undo log is active but cannot be replayed.
    #[error("corrupt log: {message}")]
    CorruptLog {
        /// Description of the corruption.
        message: String,
    },

    /// A deletion list, value file or index file is malformed.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// `change_key` was asked to move a key that resolves nowhere.
    #[error("key not found in index {index_id}")]
    KeyNotFound {
        /// The index that was searched.
        index_id: u16,
    },

    /// Key length does not match the index key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// A read asked for bytes past the logical end of a value.
    #[error("read of {len} bytes at offset {offset} exceeds value length {length}")]
    ReadOutOfBounds {
        /// Requested read offset.
        offset: u32,
        /// Requested read length.
        len: usize,
        /// Logical value length.
        length: u32,
    },

    /// The index id was never loaded on this database.
    #[error("index {index_id} is not loaded")]
    UnknownIndex {
        /// The requested index.
        index_id: u16,
    },

    /// Argument outside the range the on-disk format can represent.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Staged changes are still waiting for a commit.
    #[error("staged changes are pending; commit or discard them before closing")]
    PendingStaged,

    /// A failed commit could not be rolled back in-process.
    ///
    /// The files are left for recovery on the next open.
    #[error("database is poisoned after a failed rollback; reopen to recover")]
    Poisoned,
}

impl CoreError {
    /// Creates a corrupt log error.
    pub fn corrupt_log(message: impl Into<String>) -> Self {
        Self::CorruptLog {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true for errors after which the handle cannot be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptLog { .. } | Self::Poisoned)
    }
}
