//! Turns a committing tier into physical writes.
//!
//! Planning works on copies of the deletion list and value cursor and on
//! buffered index transactions; nothing touches the files until the plan
//! is logged and applied.

use super::tier::{apply_patch, patched_len, Change, Patch, Tier};
use crate::error::{CoreError, CoreResult};
use crate::files::FileSet;
use crate::index::{lookup, IndexTree, IndexUpdate};
use crate::store::{self, FreeList, ValueFiles};
use crate::types::{FileRef, Locator, SENTINEL_DELETED};
use crate::wal::{LogSnapshot, PhysicalWrite};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Everything a commit writes, plus the state to install once it is durable.
pub(crate) struct CommitPlan {
    pub snapshot: LogSnapshot,
    /// Sorted by file then offset; no two writes overlap.
    pub writes: Vec<PhysicalWrite>,
    pub free_list: FreeList,
    pub values: ValueFiles,
    pub updates: Vec<(u16, IndexUpdate)>,
}

struct Planner<'a> {
    files: &'a FileSet,
    free_list: FreeList,
    values: ValueFiles,
    writes: Vec<PhysicalWrite>,
}

/// Plans the commit of `tier` against the durable state.
pub(crate) fn plan(
    files: &FileSet,
    free_list: &FreeList,
    values: &ValueFiles,
    indexes: &HashMap<u16, IndexTree>,
    tier: &Tier,
) -> CoreResult<CommitPlan> {
    let mut snapshot = LogSnapshot {
        deletion_count: free_list.count(),
        value_last_file: values.last_file(),
        value_last_size: values.last_size(),
        indexes: Vec::new(),
    };
    let mut planner = Planner {
        files,
        free_list: free_list.clone(),
        values: values.clone(),
        writes: Vec::new(),
    };

    let mut updates = Vec::new();
    for (id, changes) in tier.indexes() {
        let tree = indexes
            .get(&id)
            .ok_or(CoreError::UnknownIndex { index_id: id })?;
        snapshot.indexes.push(tree.snapshot());
        let (update, writes) = planner.plan_index(tree, changes)?;
        planner.writes.extend(writes);
        updates.push((id, update));
    }

    if let Some(extra) = tier.extra() {
        planner.values.set_extra(extra);
    }

    let Planner {
        mut free_list,
        values,
        mut writes,
        ..
    } = planner;
    writes.extend(free_list.take_writes());
    writes.push(values.header_write());
    writes.sort_by_key(|w| (w.target, w.offset));

    Ok(CommitPlan {
        snapshot,
        writes,
        free_list,
        values,
        updates,
    })
}

impl Planner<'_> {
    fn plan_index(
        &mut self,
        tree: &IndexTree,
        changes: &BTreeMap<Vec<u8>, Change>,
    ) -> CoreResult<(IndexUpdate, Vec<PhysicalWrite>)> {
        let view = tree.view(self.files);

        // Durable entries of every key and rename source involved.
        let mut stored: HashMap<&[u8], Option<Locator>> = HashMap::new();
        for (key, change) in changes {
            stored.insert(key, lookup(&view, key)?);
            if let Change::Patched { base, .. } = change {
                if let Entry::Vacant(slot) = stored.entry(base.as_slice()) {
                    slot.insert(lookup(&view, base)?);
                }
            }
        }
        let live = |key: &[u8]| {
            stored
                .get(key)
                .copied()
                .flatten()
                .filter(|loc| !loc.is_deleted())
        };

        // A pure rename hands the stored bytes to the new key. The source must
        // be rewritten or removed in this tier, or both keys would share them.
        let mut claimed: HashMap<&[u8], &[u8]> = HashMap::new();
        for (key, change) in changes {
            if let Change::Patched { base, patches } = change {
                if patches.is_empty()
                    && base != key
                    && changes.contains_key(base)
                    && live(base).is_some()
                {
                    claimed.entry(base.as_slice()).or_insert(key.as_slice());
                }
            }
        }

        let mut txn = tree.begin(self.files);
        for (key, change) in changes {
            let raw = stored.get(key.as_slice()).copied().flatten();
            let owned = if claimed.contains_key(key.as_slice()) {
                None
            } else {
                raw.filter(|loc| !loc.is_deleted())
            };

            match change {
                Change::Removed => {
                    if raw.is_some() {
                        txn.remove(key)?;
                    }
                    if let Some(loc) = owned {
                        store::release(&mut self.free_list, loc);
                    }
                }
                Change::Full(value) => {
                    let locator = self.place(value, owned)?;
                    if raw != Some(locator) {
                        txn.insert(key, locator)?;
                    }
                }
                Change::Patched { base, patches } => {
                    let source = live(base);
                    if claimed.get(base.as_slice()) == Some(&key.as_slice()) {
                        if let Some(loc) = source {
                            txn.insert(key, loc)?;
                        }
                        if let Some(loc) = owned {
                            store::release(&mut self.free_list, loc);
                        }
                    } else if patches.is_empty() && source.is_none() {
                        if raw.is_some() {
                            txn.remove(key)?;
                        }
                        if let Some(loc) = owned {
                            store::release(&mut self.free_list, loc);
                        }
                    } else if let Some(loc) = owned.filter(|loc| {
                        let refs: Vec<&Patch> = patches.iter().collect();
                        base == key && patched_len(loc.length, &refs) == u64::from(loc.length)
                    }) {
                        self.patch_in_place(loc, patches)?;
                    } else {
                        let mut value = match source {
                            Some(loc) => self.read(loc)?,
                            None => Vec::new(),
                        };
                        for p in patches {
                            apply_patch(&mut value, p.offset, &p.bytes);
                        }
                        let locator = self.place(&value, owned)?;
                        if raw != Some(locator) {
                            txn.insert(key, locator)?;
                        }
                    }
                }
            }
        }
        Ok(txn.finish())
    }

    fn read(&self, loc: Locator) -> CoreResult<Vec<u8>> {
        if loc.length == 0 {
            return Ok(Vec::new());
        }
        self.files.read(
            FileRef::Value(loc.file_id),
            u64::from(loc.offset),
            loc.length as usize,
        )
    }

    /// Stores `value`, reusing the key's old space when it is large enough.
    fn place(&mut self, value: &[u8], old: Option<Locator>) -> CoreResult<Locator> {
        let length = u32::try_from(value.len())
            .ok()
            .filter(|&n| n != SENTINEL_DELETED)
            .ok_or_else(|| {
                CoreError::invalid_argument(format!("value of {} bytes is too long", value.len()))
            })?;

        let locator = match old {
            Some(old) if length > 0 && length <= old.length => {
                store::release(
                    &mut self.free_list,
                    Locator::new(old.file_id, old.offset + length, old.length - length),
                );
                Locator::new(old.file_id, old.offset, length)
            }
            _ => {
                if let Some(old) = old {
                    store::release(&mut self.free_list, old);
                }
                store::allocate(&mut self.free_list, &mut self.values, length)?
            }
        };
        if length > 0 {
            self.writes.push(PhysicalWrite::new(
                FileRef::Value(locator.file_id),
                u64::from(locator.offset),
                value.to_vec(),
            ));
        }
        Ok(locator)
    }

    /// Rewrites only the patched span of a value whose length is unchanged.
    fn patch_in_place(&mut self, loc: Locator, patches: &[Patch]) -> CoreResult<()> {
        let Some(start) = patches.iter().map(|p| p.offset).min() else {
            return Ok(());
        };
        let end = patches
            .iter()
            .map(|p| p.offset + p.bytes.len() as u32)
            .max()
            .unwrap_or(start);
        if end == start {
            return Ok(());
        }
        let target = FileRef::Value(loc.file_id);
        let at = u64::from(loc.offset) + u64::from(start);
        let mut span = self.files.read(target, at, (end - start) as usize)?;
        for p in patches {
            apply_patch(&mut span, p.offset - start, &p.bytes);
        }
        self.writes.push(PhysicalWrite::new(target, at, span));
        Ok(())
    }
}
