//! Database statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stagedb_core::{Config, Database};
//!
//! let db = Database::open_in_memory(Config::default())?;
//! // ... writes, stage, commit ...
//! let stats = db.stats();
//! println!("commits: {}", stats.commits);
//! println!("free ranges: {}", stats.active_deletion_entries);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters, updated while the database runs.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    commits: AtomicU64,
    auto_commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auto_commit(&self) {
        self.auto_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into `stats`.
    pub(crate) fn fill(&self, stats: &mut DatabaseStats) {
        stats.reads = self.reads.load(Ordering::Relaxed);
        stats.writes = self.writes.load(Ordering::Relaxed);
        stats.removes = self.removes.load(Ordering::Relaxed);
        stats.commits = self.commits.load(Ordering::Relaxed);
        stats.auto_commits = self.auto_commits.load(Ordering::Relaxed);
        stats.rollbacks = self.rollbacks.load(Ordering::Relaxed);
    }
}

/// A point-in-time view of a database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseStats {
    /// Value reads (`read_value`, `get`).
    pub reads: u64,
    /// Full and partial value writes.
    pub writes: u64,
    /// Value removals.
    pub removes: u64,
    /// Successful commits.
    pub commits: u64,
    /// Commits started by `stage()` on its own.
    pub auto_commits: u64,
    /// Failed commits undone in-process.
    pub rollbacks: u64,
    /// Slots in the deletion list, active or not.
    pub deletion_entries: u32,
    /// Deletion list slots holding reusable space.
    pub active_deletion_entries: usize,
    /// Id of the value file new values are appended to.
    pub value_last_file: u16,
    /// Append offset in the last value file.
    pub value_last_size: u32,
    /// Indexes loaded on this handle.
    pub loaded_indexes: usize,
    /// Index nodes currently cached, over all indexes.
    pub cached_nodes: usize,
    /// Node lookups served from the cache.
    pub cache_hits: u64,
    /// Node lookups that went to the index files.
    pub cache_misses: u64,
    /// Approximate size of the staged changes.
    pub staged_bytes: usize,
}
