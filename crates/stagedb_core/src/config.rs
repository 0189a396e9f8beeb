//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Size of the extra data blob for new databases.
    ///
    /// Existing databases keep the size recorded in their value file header.
    pub extra_data_size: u32,

    /// Staged bytes above which `stage()` commits automatically (0 = never).
    pub cache_limit: usize,

    /// `stage()` commits automatically once the last commit is this old.
    pub commit_gap: Option<Duration>,

    /// Value and index files roll over to a new file past this size.
    pub max_file_size: u32,

    /// Entries per B-tree node for newly created indexes.
    pub index_node_elements: u8,

    /// Whether to fsync touched files during commit.
    ///
    /// Turning this off trades crash safety for speed and is meant for tests.
    pub sync_on_commit: bool,
}

/// Default B-tree fan-out.
pub const DEFAULT_NODE_ELEMENTS: u8 = 64;

/// Smallest fan-out that still splits and merges correctly.
pub const MIN_NODE_ELEMENTS: u8 = 3;

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            extra_data_size: 0,
            cache_limit: 0,
            commit_gap: None,
            max_file_size: u32::MAX,
            index_node_elements: DEFAULT_NODE_ELEMENTS,
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the extra data size used when creating a database.
    #[must_use]
    pub const fn extra_data_size(mut self, size: u32) -> Self {
        self.extra_data_size = size;
        self
    }

    /// Sets the staged byte limit that triggers an automatic commit.
    #[must_use]
    pub const fn cache_limit(mut self, bytes: usize) -> Self {
        self.cache_limit = bytes;
        self
    }

    /// Sets the maximum time between commits driven by `stage()`.
    #[must_use]
    pub const fn commit_gap(mut self, gap: Duration) -> Self {
        self.commit_gap = Some(gap);
        self
    }

    /// Sets the maximum size of a value or index file.
    #[must_use]
    pub const fn max_file_size(mut self, size: u32) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the node fan-out for new indexes, clamped to the supported minimum.
    #[must_use]
    pub const fn index_node_elements(mut self, elements: u8) -> Self {
        self.index_node_elements = if elements < MIN_NODE_ELEMENTS {
            MIN_NODE_ELEMENTS
        } else {
            elements
        };
        self
    }

    /// Sets whether commits fsync touched files.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}
