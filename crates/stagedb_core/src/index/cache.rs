//! Node cache for one index.
//!
//! Uses clock eviction (approximate LRU). Cached nodes are immutable
//! `Arc`s; a commit that rewrites a node replaces its entry, so a reader
//! never sees a version older than the files.

use super::node::{Node, NodeLoc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct CacheEntry {
    node: Arc<Node>,
    /// Second-chance bit, set on every hit.
    accessed: bool,
}

#[derive(Default)]
struct CacheInner {
    nodes: HashMap<NodeLoc, CacheEntry>,
    order: Vec<NodeLoc>,
    hand: usize,
}

/// Clock cache bounded by a byte budget.
pub(crate) struct NodeCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    /// Creates a cache holding at most `limit_bytes / node_size` nodes.
    pub(crate) fn new(limit_bytes: usize, node_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: limit_bytes / node_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self, loc: NodeLoc) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.nodes.get_mut(&loc) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.node))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Inserts or replaces a node, evicting one if the cache is full.
    pub(crate) fn insert(&self, loc: NodeLoc, node: Arc<Node>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.nodes.get_mut(&loc) {
            entry.node = node;
            entry.accessed = true;
            return;
        }
        if inner.nodes.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }
        inner.order.push(loc);
        inner.nodes.insert(
            loc,
            CacheEntry {
                node,
                accessed: true,
            },
        );
    }

    pub(crate) fn remove(&self, loc: NodeLoc) {
        let mut inner = self.inner.lock();
        if inner.nodes.remove(&loc).is_some() {
            inner.order.retain(|&l| l != loc);
            if inner.hand >= inner.order.len() {
                inner.hand = 0;
            }
        }
    }

    fn evict_one(inner: &mut CacheInner) {
        // Two sweeps clear every second-chance bit, so this terminates.
        for _ in 0..inner.order.len() * 2 {
            if inner.hand >= inner.order.len() {
                inner.hand = 0;
            }
            let loc = inner.order[inner.hand];
            let accessed = inner.nodes.get(&loc).is_some_and(|e| e.accessed);
            if accessed {
                if let Some(entry) = inner.nodes.get_mut(&loc) {
                    entry.accessed = false;
                }
                inner.hand += 1;
            } else {
                inner.nodes.remove(&loc);
                let hand = inner.hand;
                inner.order.remove(hand);
                return;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Returns (hits, misses) since creation.
    pub(crate) fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
