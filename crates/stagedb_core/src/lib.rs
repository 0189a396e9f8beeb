//! # StageDB Core
//!
//! Embedded key-value engine with staged, atomic commits.
//!
//! This crate provides:
//! - Multiple indexes per database, each a B-tree over fixed-width keys
//! - Three tiers of visibility: current writes, staged changes, disk
//! - Commits that are atomic across indexes, backed by an undo log
//! - Reuse of freed value space through a deletion list
//! - Range iteration over committed keys
//!
//! ## Example
//!
//! ```rust
//! use stagedb_core::{Config, Database};
//!
//! let db = Database::open_in_memory(Config::default()).unwrap();
//! let users = db.load_index(0, 4, 1 << 20).unwrap();
//!
//! db.write_value(users, &7u32.to_be_bytes(), b"ada").unwrap();
//! db.stage().unwrap();
//! db.commit().unwrap();
//!
//! assert_eq!(db.get(users, &7u32.to_be_bytes()).unwrap().unwrap(), b"ada");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
pub mod config;
mod database;
pub mod dir;
pub mod error;
mod files;
mod index;
mod iter;
mod stats;
mod store;
mod transaction;
pub mod types;
mod value;
mod wal;

pub use config::Config;
pub use database::Database;
pub use dir::{DatabaseDir, FileOpener, MemoryFiles};
pub use error::{CoreError, CoreResult};
pub use iter::{RangeEntries, RangeIterator};
pub use stats::DatabaseStats;
pub use store::DeletionEntry;
pub use types::{FileRef, IndexHandle, Locator, SENTINEL_DELETED};
