//! Undo log for atomic commits and crash recovery.
//!
//! Before a commit touches any data file, the bytes it is about to replace
//! are copied into `log.dat`. If the process dies mid-commit, the next open
//! finds the log active and writes those bytes back.
//!
//! ## Log Format
//!
//! ```text
//! | active (1) | crc32 (4) | snapshot | record* |
//! snapshot = | deletion_count (4) | value_last_file (2) | value_last_size (4)
//!            | index_count (2) | index_count × (id (2) | last_file (2) | last_size (4)) |
//! record   = | kind (1) | index_id (2) | file_id (2) | offset (4) | len (4) | previous (len) |
//! ```
//!
//! The checksum covers everything after it.
//!
//! ## Commit Protocol
//!
//! 1. Write the log with the flag clear, fsync, set the flag, fsync
//! 2. Apply the commit's writes and fsync every touched file
//! 3. Clear the flag, fsync, truncate the log
//!
//! ## Recovery
//!
//! An active log is replayed in reverse after cutting every file back to
//! its snapshot size and deleting files created past it. A log that is
//! active but fails its checksum is `CorruptLog`; the database refuses to
//! open rather than guess. Replaying twice has no further effect.

mod record;
mod undo;

pub(crate) use record::{IndexSnapshot, LogSnapshot, PhysicalWrite};
pub(crate) use undo::{finalize, recover, write_undo_log};
