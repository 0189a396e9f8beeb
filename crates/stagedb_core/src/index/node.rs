//! B-tree node and index header layout.
//!
//! ## Header (`idx_<id>_0.dat`, 20 bytes)
//!
//! ```text
//! | last_file (2) | last_size (4) | root_file (2) | root_offset (4) | key_size (1) | elements (1) |
//! | free_file (2) | free_offset (4) |
//! ```
//!
//! `free_*` heads the chain of released node slots. Each free slot starts
//! with the location of the next one. File 0 offset 0 holds the header, so
//! `(0, 0)` ends the chain.
//!
//! ## Node (fixed size per index)
//!
//! ```text
//! | leaf (1) | count (1) | elements × (key | file_id (2) | offset (4) | length (4)) |
//! | (elements + 1) × child (file (2) | offset (4)) |
//! ```
//!
//! Unused entry and child slots are zero.

use crate::codec::{corruption, put_u16, put_u32, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::types::Locator;
use std::cmp::Ordering;

pub(crate) const HEADER_SIZE: u32 = 20;
pub(crate) const CHILD_SIZE: usize = 6;
const LOCATOR_SIZE: usize = 10;

/// Position of a node in the index files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeLoc {
    pub file: u16,
    pub offset: u32,
}

impl NodeLoc {
    pub(crate) const fn new(file: u16, offset: u32) -> Self {
        Self { file, offset }
    }

    /// Encodes an optional location, `None` as `(0, 0)`.
    pub(crate) fn encode_link(link: Option<Self>) -> Vec<u8> {
        let loc = link.unwrap_or(Self::new(0, 0));
        let mut out = Vec::with_capacity(CHILD_SIZE);
        put_u16(&mut out, loc.file);
        put_u32(&mut out, loc.offset);
        out
    }

    pub(crate) fn decode_link(reader: &mut ByteReader<'_>) -> CoreResult<Option<Self>> {
        let loc = Self::new(reader.u16()?, reader.u32()?);
        Ok((loc != Self::new(0, 0)).then_some(loc))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub key: Vec<u8>,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Node {
    pub leaf: bool,
    pub entries: Vec<IndexEntry>,
    /// `entries.len() + 1` children for inner nodes, empty for leaves.
    pub children: Vec<NodeLoc>,
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Self {
            leaf: true,
            ..Self::default()
        }
    }

    /// Binary search by unsigned byte order.
    pub(crate) fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Number of entries ordered before `key` (strictly, or inclusive of it).
    pub(crate) fn rank(&self, key: &[u8], inclusive: bool) -> usize {
        self.entries.partition_point(|e| match e.key.as_slice().cmp(key) {
            Ordering::Less => true,
            Ordering::Equal => inclusive,
            Ordering::Greater => false,
        })
    }
}

/// Fixed node geometry of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLayout {
    pub key_size: usize,
    pub elements: usize,
}

impl NodeLayout {
    pub(crate) fn node_size(&self) -> usize {
        2 + self.elements * (self.key_size + LOCATOR_SIZE) + (self.elements + 1) * CHILD_SIZE
    }

    pub(crate) fn encode(&self, node: &Node) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.node_size());
        out.push(u8::from(node.leaf));
        out.push(node.entries.len() as u8);
        for entry in &node.entries {
            out.extend_from_slice(&entry.key);
            put_u16(&mut out, entry.locator.file_id);
            put_u32(&mut out, entry.locator.offset);
            put_u32(&mut out, entry.locator.length);
        }
        let entries_end = 2 + self.elements * (self.key_size + LOCATOR_SIZE);
        out.resize(entries_end, 0);
        for child in &node.children {
            put_u16(&mut out, child.file);
            put_u32(&mut out, child.offset);
        }
        out.resize(self.node_size(), 0);
        out
    }

    pub(crate) fn decode(&self, data: &[u8]) -> CoreResult<Node> {
        let mut reader = ByteReader::new(data, corruption);
        let leaf = match reader.u8()? {
            0 => false,
            1 => true,
            other => return Err(CoreError::corruption(format!("node leaf flag {other}"))),
        };
        let count = reader.u8()? as usize;
        if count > self.elements {
            return Err(CoreError::corruption(format!(
                "node holds {count} entries, limit is {}",
                self.elements
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = reader.bytes(self.key_size)?.to_vec();
            let locator = Locator::new(reader.u16()?, reader.u32()?, reader.u32()?);
            entries.push(IndexEntry { key, locator });
        }
        reader.bytes((self.elements - count) * (self.key_size + LOCATOR_SIZE))?;

        let mut children = Vec::new();
        if !leaf {
            for _ in 0..=count {
                children.push(NodeLoc::new(reader.u16()?, reader.u32()?));
            }
        }
        Ok(Node {
            leaf,
            entries,
            children,
        })
    }
}

/// Header stored at the start of the first node file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexHeader {
    pub last_file: u16,
    pub last_size: u32,
    pub root: NodeLoc,
    pub key_size: u8,
    pub elements: u8,
    /// First released node slot.
    pub free: Option<NodeLoc>,
}

impl IndexHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        put_u16(&mut out, self.last_file);
        put_u32(&mut out, self.last_size);
        put_u16(&mut out, self.root.file);
        put_u32(&mut out, self.root.offset);
        out.push(self.key_size);
        out.push(self.elements);
        out.extend_from_slice(&NodeLoc::encode_link(self.free));
        out
    }

    pub(crate) fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(data, corruption);
        Ok(Self {
            last_file: reader.u16()?,
            last_size: reader.u32()?,
            root: NodeLoc::new(reader.u16()?, reader.u32()?),
            key_size: reader.u8()?,
            elements: reader.u8()?,
            free: NodeLoc::decode_link(&mut reader)?,
        })
    }

    pub(crate) fn layout(&self) -> NodeLayout {
        NodeLayout {
            key_size: self.key_size as usize,
            elements: self.elements as usize,
        }
    }
}
