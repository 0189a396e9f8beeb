//! Uncommitted changes layered over the durable state.
//!
//! Writes land in the current tier. `stage` folds it into the staged tier,
//! and a commit moves the staged tier aside as the committing tier while it
//! is planned and applied, so plain writes and `stage` never wait for
//! disk work. Reads resolve current, then staged, then committing, then
//! disk; the first tier with a record for the key decides.

mod planner;
mod tier;

pub(crate) use planner::{plan, CommitPlan};
pub(crate) use tier::{patched_len, read_patched, Patch, Tier};

use tier::Change;
use std::collections::HashMap;
use std::sync::Arc;

/// How a key resolves across the in-memory tiers.
#[derive(Debug)]
pub(crate) enum Resolved<'a> {
    /// Removed in some tier (or missing with nothing to patch).
    Absent,
    /// Held in memory, possibly with patches on top.
    Memory {
        bytes: &'a [u8],
        patches: Vec<&'a Patch>,
    },
    /// Whatever disk holds under `key`, with patches on top.
    Disk {
        key: &'a [u8],
        patches: Vec<&'a Patch>,
    },
}

impl<'a> Resolved<'a> {
    fn with_patches(self, upper: &'a [Patch]) -> Self {
        if upper.is_empty() {
            return self;
        }
        match self {
            Self::Absent => Self::Memory {
                bytes: &[],
                patches: upper.iter().collect(),
            },
            Self::Memory { bytes, mut patches } => {
                patches.extend(upper);
                Self::Memory { bytes, patches }
            }
            Self::Disk { key, mut patches } => {
                patches.extend(upper);
                Self::Disk { key, patches }
            }
        }
    }
}

fn resolve_in<'a>(tiers: &[&'a Tier], index: u16, key: &'a [u8]) -> Resolved<'a> {
    for (i, tier) in tiers.iter().enumerate() {
        match tier.get(index, key) {
            None => continue,
            Some(Change::Removed) => return Resolved::Absent,
            Some(Change::Full(bytes)) => {
                return Resolved::Memory {
                    bytes,
                    patches: Vec::new(),
                }
            }
            Some(Change::Patched { base, patches }) => {
                return resolve_in(&tiers[i + 1..], index, base).with_patches(patches);
            }
        }
    }
    Resolved::Disk {
        key,
        patches: Vec::new(),
    }
}

/// The in-memory tiers plus the key sizes of loaded indexes.
#[derive(Default)]
pub(crate) struct Overlay {
    pub current: Tier,
    pub staged: Tier,
    pub committing: Option<Arc<Tier>>,
    key_sizes: HashMap<u16, usize>,
}

impl Overlay {
    pub(crate) fn register_index(&mut self, index: u16, key_size: usize) {
        self.key_sizes.insert(index, key_size);
    }

    pub(crate) fn key_size(&self, index: u16) -> Option<usize> {
        self.key_sizes.get(&index).copied()
    }

    pub(crate) fn index_count(&self) -> usize {
        self.key_sizes.len()
    }

    fn tiers(&self) -> Vec<&Tier> {
        let mut tiers = vec![&self.current, &self.staged];
        if let Some(committing) = &self.committing {
            tiers.push(committing);
        }
        tiers
    }

    pub(crate) fn resolve<'a>(&'a self, index: u16, key: &'a [u8]) -> Resolved<'a> {
        resolve_in(&self.tiers(), index, key)
    }

    /// The newest extra data held in memory, if any tier changed it.
    pub(crate) fn extra(&self) -> Option<&[u8]> {
        self.tiers().into_iter().find_map(Tier::extra)
    }

    pub(crate) fn stage(&mut self) {
        let current = std::mem::take(&mut self.current);
        self.staged.absorb(current);
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = Tier::default();
    }

    /// Moves the staged tier aside for a commit. Returns `None` when there
    /// is nothing to commit.
    pub(crate) fn begin_commit(&mut self) -> Option<Arc<Tier>> {
        if self.staged.is_empty() {
            return None;
        }
        let tier = Arc::new(std::mem::take(&mut self.staged));
        self.committing = Some(Arc::clone(&tier));
        Some(tier)
    }

    pub(crate) fn end_commit(&mut self, committed: bool) {
        let Some(committing) = self.committing.take() else {
            return;
        };
        if !committed {
            // Changes staged during the commit stay on top.
            let newer = std::mem::take(&mut self.staged);
            let mut restored = Arc::unwrap_or_clone(committing);
            restored.absorb(newer);
            self.staged = restored;
        }
    }

    pub(crate) fn staged_bytes(&self) -> usize {
        self.staged.approx_bytes()
    }

    pub(crate) fn has_staged(&self) -> bool {
        !self.staged.is_empty() || self.committing.is_some()
    }
}
