//! Per-index sorted key structure.
//!
//! Each loaded index is a B-tree stored in its own node files
//! (`idx_<id>_<n>.dat`) with a bounded clock cache of decoded nodes.
//! Keys have a fixed width per index and sort by unsigned byte order.

mod btree;
mod cache;
mod node;

pub(crate) use btree::{lookup, seek, IndexTree, IndexUpdate, Seek};
pub(crate) use node::IndexEntry;
