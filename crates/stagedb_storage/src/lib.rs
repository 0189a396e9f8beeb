//! # StageDB Storage
//!
//! Random-access byte files for the StageDB engine.
//!
//! Backends are **opaque byte stores**. They know nothing about value files,
//! index nodes or the undo log; the engine owns every format decision.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral databases
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use stagedb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(0, b"hello world").unwrap();
//! backend.write_at(0, b"HELLO").unwrap();
//! assert_eq!(backend.read_at(0, 11).unwrap(), b"HELLO world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
