//! On-disk B-tree mapping fixed-width keys to value locators.
//!
//! Readers walk the tree through [`TreeView`], which reads nodes via the
//! cache. A commit edits the tree through [`IndexTxn`]: changed nodes are
//! buffered in memory and turned into writes, and the tree only adopts them
//! once those writes are durable.
//!
//! Nodes hold at most `elements` entries. An insert that overflows a node
//! splits it around the median; a removal that leaves a non-root node under
//! `elements / 2` entries borrows from a sibling or merges with one.
//! Slots of merged-away nodes join the header's free chain and are handed
//! out again before the files grow.

use super::cache::NodeCache;
use super::node::{IndexEntry, IndexHeader, Node, NodeLayout, NodeLoc, CHILD_SIZE, HEADER_SIZE};
use crate::codec::{corruption, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::files::FileSet;
use crate::types::{FileRef, Locator};
use crate::wal::{IndexSnapshot, PhysicalWrite};
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to a tree's nodes.
pub(crate) trait NodeSource {
    fn root(&self) -> NodeLoc;
    fn load(&self, loc: NodeLoc) -> CoreResult<Arc<Node>>;
}

/// Direction and strictness of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seek {
    /// Smallest key `>=` the target.
    AtOrAfter,
    /// Smallest key `>` the target.
    After,
    /// Greatest key `<=` the target.
    AtOrBefore,
    /// Greatest key `<` the target.
    Before,
}

/// One loaded index.
pub(crate) struct IndexTree {
    id: u16,
    header: IndexHeader,
    layout: NodeLayout,
    cache: NodeCache,
    max_file_size: u32,
}

impl IndexTree {
    /// Contents of a new index's first file: header plus an empty root.
    pub(crate) fn initial_file(key_size: u8, elements: u8) -> Vec<u8> {
        let layout = NodeLayout {
            key_size: key_size as usize,
            elements: elements as usize,
        };
        let header = IndexHeader {
            last_file: 0,
            last_size: HEADER_SIZE + layout.node_size() as u32,
            root: NodeLoc::new(0, HEADER_SIZE),
            key_size,
            elements,
            free: None,
        };
        let mut out = header.encode();
        out.extend_from_slice(&layout.encode(&Node::empty_leaf()));
        out
    }

    pub(crate) fn open(
        id: u16,
        files: &mut FileSet,
        key_size: u8,
        cache_limit: usize,
        max_file_size: u32,
    ) -> CoreResult<Self> {
        let first = FileRef::Index { index: id, file: 0 };
        files.ensure_open(first)?;
        if files.size(first)? < u64::from(HEADER_SIZE) {
            return Err(CoreError::corruption(format!("{first} is shorter than its header")));
        }
        let header = IndexHeader::decode(&files.read(first, 0, HEADER_SIZE as usize)?)?;
        if header.key_size != key_size {
            return Err(CoreError::InvalidKeySize {
                expected: header.key_size as usize,
                actual: key_size as usize,
            });
        }
        if header.elements < crate::config::MIN_NODE_ELEMENTS {
            return Err(CoreError::corruption(format!(
                "index {id} has {} elements per node",
                header.elements
            )));
        }
        for file in 1..=header.last_file {
            files.ensure_open(FileRef::Index { index: id, file })?;
        }

        let layout = header.layout();
        Ok(Self {
            id,
            header,
            layout,
            cache: NodeCache::new(cache_limit, layout.node_size()),
            max_file_size,
        })
    }

    pub(crate) fn key_size(&self) -> usize {
        self.layout.key_size
    }

    pub(crate) fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            id: self.id,
            last_file: self.header.last_file,
            last_size: self.header.last_size,
        }
    }

    pub(crate) fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    fn file(&self, loc: NodeLoc) -> FileRef {
        FileRef::Index {
            index: self.id,
            file: loc.file,
        }
    }

    fn read_node(&self, files: &FileSet, loc: NodeLoc) -> CoreResult<Arc<Node>> {
        if let Some(node) = self.cache.get(loc) {
            return Ok(node);
        }
        let data = files.read(self.file(loc), u64::from(loc.offset), self.layout.node_size())?;
        let node = Arc::new(self.layout.decode(&data)?);
        self.cache.insert(loc, Arc::clone(&node));
        Ok(node)
    }

    pub(crate) fn view<'a>(&'a self, files: &'a FileSet) -> TreeView<'a> {
        TreeView { tree: self, files }
    }

    pub(crate) fn begin<'a>(&'a self, files: &'a FileSet) -> IndexTxn<'a> {
        IndexTxn {
            tree: self,
            files,
            header: self.header,
            dirty: HashMap::new(),
            freed: Vec::new(),
        }
    }

    /// Adopts a finished transaction once its writes are durable.
    pub(crate) fn install(&mut self, update: IndexUpdate) {
        self.header = update.header;
        for (loc, node) in update.nodes {
            self.cache.insert(loc, node);
        }
        for loc in update.freed {
            self.cache.remove(loc);
        }
    }
}

/// Read-only view of the durable tree.
pub(crate) struct TreeView<'a> {
    tree: &'a IndexTree,
    files: &'a FileSet,
}

impl NodeSource for TreeView<'_> {
    fn root(&self) -> NodeLoc {
        self.tree.header.root
    }

    fn load(&self, loc: NodeLoc) -> CoreResult<Arc<Node>> {
        self.tree.read_node(self.files, loc)
    }
}

/// Changes produced by an [`IndexTxn`].
pub(crate) struct IndexUpdate {
    header: IndexHeader,
    nodes: Vec<(NodeLoc, Arc<Node>)>,
    freed: Vec<NodeLoc>,
}

/// Buffered edits against one tree.
pub(crate) struct IndexTxn<'a> {
    tree: &'a IndexTree,
    files: &'a FileSet,
    header: IndexHeader,
    dirty: HashMap<NodeLoc, Arc<Node>>,
    freed: Vec<NodeLoc>,
}

impl NodeSource for IndexTxn<'_> {
    fn root(&self) -> NodeLoc {
        self.header.root
    }

    fn load(&self, loc: NodeLoc) -> CoreResult<Arc<Node>> {
        match self.dirty.get(&loc) {
            Some(node) => Ok(Arc::clone(node)),
            None => self.tree.read_node(self.files, loc),
        }
    }
}

impl IndexTxn<'_> {
    fn min_entries(&self) -> usize {
        self.tree.layout.elements / 2
    }

    fn load_owned(&self, loc: NodeLoc) -> CoreResult<Node> {
        Ok(Node::clone(&*self.load(loc)?))
    }

    fn store(&mut self, loc: NodeLoc, node: Node) {
        self.dirty.insert(loc, Arc::new(node));
    }

    fn free(&mut self, loc: NodeLoc) {
        self.dirty.remove(&loc);
        self.freed.push(loc);
    }

    fn alloc(&mut self) -> CoreResult<NodeLoc> {
        if let Some(loc) = self.header.free {
            // The chain only holds slots released by earlier commits, so the
            // link is on disk.
            let link = self.files.read(self.tree.file(loc), u64::from(loc.offset), CHILD_SIZE)?;
            self.header.free = NodeLoc::decode_link(&mut ByteReader::new(&link, corruption))?;
            return Ok(loc);
        }

        let size = self.tree.layout.node_size() as u32;
        let file_start = if self.header.last_file == 0 {
            HEADER_SIZE
        } else {
            0
        };
        let fits = self
            .header
            .last_size
            .checked_add(size)
            .is_some_and(|end| end <= self.tree.max_file_size);
        if !fits && self.header.last_size > file_start {
            self.header.last_file = self.header.last_file.checked_add(1).ok_or_else(|| {
                CoreError::invalid_argument("index files exhausted the 16-bit file id space")
            })?;
            self.header.last_size = 0;
        }
        let loc = NodeLoc::new(self.header.last_file, self.header.last_size);
        self.header.last_size = self
            .header
            .last_size
            .checked_add(size)
            .ok_or_else(|| CoreError::invalid_argument("index node does not fit in a file"))?;
        Ok(loc)
    }

    /// Inserts or replaces the locator stored under `key`.
    pub(crate) fn insert(&mut self, key: &[u8], locator: Locator) -> CoreResult<()> {
        let root = self.header.root;
        let entry = IndexEntry {
            key: key.to_vec(),
            locator,
        };
        if let Some((median, right)) = self.insert_into(root, entry)? {
            let new_root = Node {
                leaf: false,
                entries: vec![median],
                children: vec![root, right],
            };
            let loc = self.alloc()?;
            self.store(loc, new_root);
            self.header.root = loc;
        }
        Ok(())
    }

    fn insert_into(
        &mut self,
        loc: NodeLoc,
        entry: IndexEntry,
    ) -> CoreResult<Option<(IndexEntry, NodeLoc)>> {
        let mut node = self.load_owned(loc)?;
        match node.search(&entry.key) {
            Ok(i) => {
                if node.entries[i].locator != entry.locator {
                    node.entries[i].locator = entry.locator;
                    self.store(loc, node);
                }
                return Ok(None);
            }
            Err(i) if node.leaf => node.entries.insert(i, entry),
            Err(i) => match self.insert_into(node.children[i], entry)? {
                Some((median, right)) => {
                    node.entries.insert(i, median);
                    node.children.insert(i + 1, right);
                }
                None => return Ok(None),
            },
        }

        if node.entries.len() <= self.tree.layout.elements {
            self.store(loc, node);
            return Ok(None);
        }

        let mid = node.entries.len() / 2;
        let right_entries = node.entries.split_off(mid + 1);
        let median = node
            .entries
            .pop()
            .ok_or_else(|| CoreError::corruption("split of an empty node"))?;
        let right_children = if node.leaf {
            Vec::new()
        } else {
            node.children.split_off(mid + 1)
        };
        let right = Node {
            leaf: node.leaf,
            entries: right_entries,
            children: right_children,
        };
        let right_loc = self.alloc()?;
        self.store(loc, node);
        self.store(right_loc, right);
        Ok(Some((median, right_loc)))
    }

    /// Removes `key`. Returns false if it was not present.
    pub(crate) fn remove(&mut self, key: &[u8]) -> CoreResult<bool> {
        let root = self.header.root;
        if !self.remove_from(root, key)? {
            return Ok(false);
        }
        let node = self.load(root)?;
        if !node.leaf && node.entries.is_empty() {
            self.header.root = node.children[0];
            self.free(root);
        }
        Ok(true)
    }

    fn remove_from(&mut self, loc: NodeLoc, key: &[u8]) -> CoreResult<bool> {
        let mut node = self.load_owned(loc)?;
        match node.search(key) {
            Ok(i) if node.leaf => {
                node.entries.remove(i);
            }
            Ok(i) => {
                node.entries[i] = self.pop_max(node.children[i])?;
                self.rebalance(&mut node, i)?;
            }
            Err(_) if node.leaf => return Ok(false),
            Err(i) => {
                if !self.remove_from(node.children[i], key)? {
                    return Ok(false);
                }
                self.rebalance(&mut node, i)?;
            }
        }
        self.store(loc, node);
        Ok(true)
    }

    /// Removes and returns the greatest entry below `loc`.
    fn pop_max(&mut self, loc: NodeLoc) -> CoreResult<IndexEntry> {
        let mut node = self.load_owned(loc)?;
        let entry = if node.leaf {
            node.entries
                .pop()
                .ok_or_else(|| CoreError::corruption("empty leaf below an inner node"))?
        } else {
            let last = node
                .children
                .len()
                .checked_sub(1)
                .ok_or_else(|| CoreError::corruption("inner node without children"))?;
            let entry = self.pop_max(node.children[last])?;
            self.rebalance(&mut node, last)?;
            entry
        };
        self.store(loc, node);
        Ok(entry)
    }

    /// Restores the minimum fill of `parent.children[i]`.
    fn rebalance(&mut self, parent: &mut Node, i: usize) -> CoreResult<()> {
        let min = self.min_entries();
        let child_loc = parent.children[i];
        let mut child = self.load_owned(child_loc)?;
        if child.entries.len() >= min {
            return Ok(());
        }

        if i > 0 {
            let left_loc = parent.children[i - 1];
            let mut left = self.load_owned(left_loc)?;
            if left.entries.len() > min {
                let borrowed = left
                    .entries
                    .pop()
                    .ok_or_else(|| CoreError::corruption("empty sibling"))?;
                let separator = std::mem::replace(&mut parent.entries[i - 1], borrowed);
                child.entries.insert(0, separator);
                if !child.leaf {
                    let moved = left
                        .children
                        .pop()
                        .ok_or_else(|| CoreError::corruption("inner sibling without children"))?;
                    child.children.insert(0, moved);
                }
                self.store(left_loc, left);
                self.store(child_loc, child);
                return Ok(());
            }
        }

        if i + 1 < parent.children.len() {
            let right_loc = parent.children[i + 1];
            let mut right = self.load_owned(right_loc)?;
            if right.entries.len() > min {
                let borrowed = right.entries.remove(0);
                let separator = std::mem::replace(&mut parent.entries[i], borrowed);
                child.entries.push(separator);
                if !child.leaf {
                    child.children.push(right.children.remove(0));
                }
                self.store(right_loc, right);
                self.store(child_loc, child);
                return Ok(());
            }
        }

        let (left_idx, mut left, right) = if i > 0 {
            (i - 1, self.load_owned(parent.children[i - 1])?, child)
        } else if parent.children.len() > 1 {
            (i, child, self.load_owned(parent.children[i + 1])?)
        } else {
            return Err(CoreError::corruption("underfull node has no siblings"));
        };

        let separator = parent.entries.remove(left_idx);
        let right_loc = parent.children.remove(left_idx + 1);
        left.entries.push(separator);
        left.entries.extend(right.entries);
        left.children.extend(right.children);
        self.store(parent.children[left_idx], left);
        self.free(right_loc);
        Ok(())
    }

    /// Turns the buffered nodes and released slots into writes.
    pub(crate) fn finish(mut self) -> (IndexUpdate, Vec<PhysicalWrite>) {
        let id = self.tree.id;
        let mut writes = Vec::new();
        for &loc in &self.freed {
            writes.push(PhysicalWrite::new(
                self.tree.file(loc),
                u64::from(loc.offset),
                NodeLoc::encode_link(self.header.free),
            ));
            self.header.free = Some(loc);
        }
        if !self.dirty.is_empty() || self.header != self.tree.header {
            writes.push(PhysicalWrite::new(
                FileRef::Index { index: id, file: 0 },
                0,
                self.header.encode(),
            ));
        }
        let mut nodes: Vec<(NodeLoc, Arc<Node>)> = self.dirty.into_iter().collect();
        nodes.sort_by_key(|(loc, _)| *loc);
        for (loc, node) in &nodes {
            writes.push(PhysicalWrite::new(
                self.tree.file(*loc),
                u64::from(loc.offset),
                self.tree.layout.encode(node),
            ));
        }
        (
            IndexUpdate {
                header: self.header,
                nodes,
                freed: self.freed,
            },
            writes,
        )
    }
}

/// Returns the locator stored under `key`, tombstones included.
pub(crate) fn lookup<S: NodeSource>(src: &S, key: &[u8]) -> CoreResult<Option<Locator>> {
    let mut loc = src.root();
    loop {
        let node = src.load(loc)?;
        match node.search(key) {
            Ok(i) => return Ok(Some(node.entries[i].locator)),
            Err(_) if node.leaf => return Ok(None),
            Err(i) => loc = node.children[i],
        }
    }
}

/// Finds the nearest live entry in the given direction.
pub(crate) fn seek<S: NodeSource>(
    src: &S,
    key: &[u8],
    mode: Seek,
) -> CoreResult<Option<IndexEntry>> {
    let mut target = key.to_vec();
    let mut mode = mode;
    loop {
        let found = match mode {
            Seek::AtOrAfter => seek_up(src, src.root(), &target, true)?,
            Seek::After => seek_up(src, src.root(), &target, false)?,
            Seek::AtOrBefore => seek_down(src, src.root(), &target, true)?,
            Seek::Before => seek_down(src, src.root(), &target, false)?,
        };
        match found {
            Some(entry) if entry.locator.is_deleted() => {
                mode = match mode {
                    Seek::AtOrAfter | Seek::After => Seek::After,
                    Seek::AtOrBefore | Seek::Before => Seek::Before,
                };
                target = entry.key;
            }
            other => return Ok(other),
        }
    }
}

fn seek_up<S: NodeSource>(
    src: &S,
    loc: NodeLoc,
    key: &[u8],
    inclusive: bool,
) -> CoreResult<Option<IndexEntry>> {
    let node = src.load(loc)?;
    let i = node.rank(key, !inclusive);
    if !node.leaf {
        if let Some(entry) = seek_up(src, node.children[i], key, inclusive)? {
            return Ok(Some(entry));
        }
    }
    Ok(node.entries.get(i).cloned())
}

fn seek_down<S: NodeSource>(
    src: &S,
    loc: NodeLoc,
    key: &[u8],
    inclusive: bool,
) -> CoreResult<Option<IndexEntry>> {
    let node = src.load(loc)?;
    let i = node.rank(key, inclusive);
    if !node.leaf {
        if let Some(entry) = seek_down(src, node.children[i], key, inclusive)? {
            return Ok(Some(entry));
        }
    }
    Ok(i.checked_sub(1).and_then(|j| node.entries.get(j).cloned()))
}
