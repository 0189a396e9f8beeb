//! One layer of uncommitted changes.

use crate::error::CoreResult;
use std::collections::BTreeMap;

/// Bytes written at an offset into a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Patch {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl Patch {
    fn end(&self) -> u64 {
        u64::from(self.offset) + self.bytes.len() as u64
    }
}

/// What a tier records for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    /// The key is gone at this tier.
    Removed,
    /// The complete value.
    Full(Vec<u8>),
    /// The value `base` has in the tiers below, with `patches` applied in
    /// order. A missing base reads as empty when there are patches.
    ///
    /// `base` differs from the key after a rename.
    Patched { base: Vec<u8>, patches: Vec<Patch> },
}

/// Per-index changes plus an optional new extra data blob.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tier {
    indexes: BTreeMap<u16, BTreeMap<Vec<u8>, Change>>,
    extra: Option<Vec<u8>>,
}

/// Writes `bytes` at `offset` into `value`, zero-filling any gap.
pub(crate) fn apply_patch(value: &mut Vec<u8>, offset: u32, bytes: &[u8]) {
    let start = offset as usize;
    let end = start + bytes.len();
    if value.len() < end {
        value.resize(end, 0);
    }
    value[start..end].copy_from_slice(bytes);
}

/// Logical length of a base of `base_len` bytes once `patches` apply.
pub(crate) fn patched_len(base_len: u32, patches: &[&Patch]) -> u64 {
    patches
        .iter()
        .map(|p| p.end())
        .fold(u64::from(base_len), u64::max)
}

/// Fills `out` with bytes `offset..offset + out.len()` of a patched value.
///
/// `read_base` is asked only for the part of the range that overlaps the
/// base.
pub(crate) fn read_patched(
    base_len: u32,
    read_base: impl FnOnce(u32, usize) -> CoreResult<Vec<u8>>,
    patches: &[&Patch],
    offset: u32,
    out: &mut [u8],
) -> CoreResult<()> {
    let start = u64::from(offset);
    let end = start + out.len() as u64;
    out.fill(0);

    let base_end = end.min(u64::from(base_len));
    if start < base_end {
        let bytes = read_base(offset, (base_end - start) as usize)?;
        out[..bytes.len()].copy_from_slice(&bytes);
    }

    for patch in patches {
        let p_start = u64::from(patch.offset).max(start);
        let p_end = patch.end().min(end);
        if p_start < p_end {
            let src = (p_start - u64::from(patch.offset)) as usize;
            let dst = (p_start - start) as usize;
            let len = (p_end - p_start) as usize;
            out[dst..dst + len].copy_from_slice(&patch.bytes[src..src + len]);
        }
    }
    Ok(())
}

impl Tier {
    pub(crate) fn is_empty(&self) -> bool {
        self.extra.is_none() && self.indexes.values().all(BTreeMap::is_empty)
    }

    pub(crate) fn get(&self, index: u16, key: &[u8]) -> Option<&Change> {
        self.indexes.get(&index)?.get(key)
    }

    pub(crate) fn extra(&self) -> Option<&[u8]> {
        self.extra.as_deref()
    }

    pub(crate) fn set_extra(&mut self, data: Vec<u8>) {
        self.extra = Some(data);
    }

    /// Changed indexes in id order.
    pub(crate) fn indexes(&self) -> impl Iterator<Item = (u16, &BTreeMap<Vec<u8>, Change>)> {
        self.indexes
            .iter()
            .filter(|(_, changes)| !changes.is_empty())
            .map(|(id, changes)| (*id, changes))
    }

    fn changes(&mut self, index: u16) -> &mut BTreeMap<Vec<u8>, Change> {
        self.indexes.entry(index).or_default()
    }

    pub(crate) fn write(&mut self, index: u16, key: &[u8], value: Vec<u8>) {
        self.changes(index).insert(key.to_vec(), Change::Full(value));
    }

    pub(crate) fn write_sub_section(&mut self, index: u16, key: &[u8], bytes: &[u8], offset: u32) {
        let changes = self.changes(index);
        match changes.get_mut(key) {
            Some(Change::Full(value)) => apply_patch(value, offset, bytes),
            Some(Change::Patched { patches, .. }) => patches.push(Patch {
                offset,
                bytes: bytes.to_vec(),
            }),
            Some(change @ Change::Removed) => {
                let mut value = Vec::new();
                apply_patch(&mut value, offset, bytes);
                *change = Change::Full(value);
            }
            None => {
                changes.insert(
                    key.to_vec(),
                    Change::Patched {
                        base: key.to_vec(),
                        patches: vec![Patch {
                            offset,
                            bytes: bytes.to_vec(),
                        }],
                    },
                );
            }
        }
    }

    pub(crate) fn remove(&mut self, index: u16, key: &[u8]) {
        self.changes(index).insert(key.to_vec(), Change::Removed);
    }

    /// Moves whatever `old` resolves to under `new`.
    ///
    /// The caller checks that `old` resolves to a value.
    pub(crate) fn rename(&mut self, index: u16, old: &[u8], new: &[u8]) {
        if old == new {
            return;
        }
        let changes = self.changes(index);
        let moved = changes.remove(old).unwrap_or_else(|| Change::Patched {
            base: old.to_vec(),
            patches: Vec::new(),
        });
        changes.insert(new.to_vec(), moved);
        changes.insert(old.to_vec(), Change::Removed);
    }

    /// Folds `upper` (a newer tier) into this one.
    ///
    /// References from `upper` into this tier are resolved against the
    /// state before any of `upper` lands.
    pub(crate) fn absorb(&mut self, upper: Tier) {
        for (index, changes) in upper.indexes {
            let lower = self.indexes.entry(index).or_default();
            let resolved: Vec<(Vec<u8>, Change)> = changes
                .into_iter()
                .map(|(key, change)| (key, resolve_against(change, lower)))
                .collect();
            lower.extend(resolved);
        }
        if upper.extra.is_some() {
            self.extra = upper.extra;
        }
    }

    /// Rough memory footprint, used for the auto-commit threshold.
    pub(crate) fn approx_bytes(&self) -> usize {
        const ENTRY_OVERHEAD: usize = 32;
        let changes: usize = self
            .indexes
            .values()
            .flat_map(BTreeMap::iter)
            .map(|(key, change)| {
                ENTRY_OVERHEAD
                    + key.len()
                    + match change {
                        Change::Removed => 0,
                        Change::Full(value) => value.len(),
                        Change::Patched { base, patches } => {
                            base.len() + patches.iter().map(|p| p.bytes.len()).sum::<usize>()
                        }
                    }
            })
            .sum();
        changes + self.extra.as_ref().map_or(0, Vec::len)
    }
}

fn resolve_against(change: Change, lower: &BTreeMap<Vec<u8>, Change>) -> Change {
    let Change::Patched { base, patches } = change else {
        return change;
    };
    match lower.get(&base) {
        None => Change::Patched { base, patches },
        Some(Change::Removed) if patches.is_empty() => Change::Removed,
        Some(Change::Removed) => {
            let mut value = Vec::new();
            for p in &patches {
                apply_patch(&mut value, p.offset, &p.bytes);
            }
            Change::Full(value)
        }
        Some(Change::Full(value)) => {
            let mut value = value.clone();
            for p in &patches {
                apply_patch(&mut value, p.offset, &p.bytes);
            }
            Change::Full(value)
        }
        Some(Change::Patched {
            base: lower_base,
            patches: lower_patches,
        }) => {
            let mut combined = lower_patches.clone();
            combined.extend(patches);
            Change::Patched {
                base: lower_base.clone(),
                patches: combined,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_section_on_full_value_edits_in_place() {
        let mut tier = Tier::default();
        tier.write(0, b"k", b"0123456789".to_vec());
        tier.write_sub_section(0, b"k", b"AB", 2);
        tier.write_sub_section(0, b"k", b"XY", 11);
        assert_eq!(
            tier.get(0, b"k"),
            Some(&Change::Full(b"01AB456789\0XY".to_vec()))
        );
    }

    #[test]
    fn sub_section_on_removed_key_undeletes() {
        let mut tier = Tier::default();
        tier.remove(0, b"k");
        tier.write_sub_section(0, b"k", b"z", 2);
        assert_eq!(tier.get(0, b"k"), Some(&Change::Full(b"\0\0z".to_vec())));
    }

    #[test]
    fn full_write_discards_patches() {
        let mut tier = Tier::default();
        tier.write_sub_section(0, b"k", b"AB", 2);
        tier.write(0, b"k", b"new".to_vec());
        assert_eq!(tier.get(0, b"k"), Some(&Change::Full(b"new".to_vec())));
    }

    #[test]
    fn rename_chain_within_one_tier() {
        let mut tier = Tier::default();
        tier.rename(0, b"a", b"b");
        tier.rename(0, b"b", b"c");
        assert_eq!(tier.get(0, b"a"), Some(&Change::Removed));
        assert_eq!(tier.get(0, b"b"), Some(&Change::Removed));
        assert_eq!(
            tier.get(0, b"c"),
            Some(&Change::Patched {
                base: b"a".to_vec(),
                patches: Vec::new()
            })
        );
    }

    #[test]
    fn absorb_resolves_against_old_lower_state() {
        let mut staged = Tier::default();
        staged.write(0, b"a", b"value".to_vec());

        let mut current = Tier::default();
        current.rename(0, b"a", b"b");
        current.write_sub_section(0, b"b", b"V", 0);
        staged.absorb(current);

        assert_eq!(staged.get(0, b"a"), Some(&Change::Removed));
        assert_eq!(staged.get(0, b"b"), Some(&Change::Full(b"Value".to_vec())));
    }

    #[test]
    fn absorb_stacks_patches_over_lower_patches() {
        let mut staged = Tier::default();
        staged.write_sub_section(0, b"k", b"AA", 0);
        let mut current = Tier::default();
        current.write_sub_section(0, b"k", b"B", 1);
        current.set_extra(vec![7]);
        staged.absorb(current);

        match staged.get(0, b"k") {
            Some(Change::Patched { base, patches }) => {
                assert_eq!(base, b"k");
                assert_eq!(patches.len(), 2);
                assert_eq!(patches[1].bytes, b"B");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(staged.extra(), Some(&[7u8][..]));
    }

    #[test]
    fn read_patched_layers_over_base() {
        let base = b"0123456789";
        let p1 = Patch {
            offset: 2,
            bytes: b"AB".to_vec(),
        };
        let p2 = Patch {
            offset: 3,
            bytes: b"xyz".to_vec(),
        };
        let p3 = Patch {
            offset: 12,
            bytes: b"!".to_vec(),
        };
        let patches = [&p1, &p2, &p3];
        assert_eq!(patched_len(10, &patches), 13);

        let mut out = [0u8; 13];
        read_patched(
            10,
            |off, len| Ok(base[off as usize..off as usize + len].to_vec()),
            &patches,
            0,
            &mut out,
        )
        .unwrap();
        assert_eq!(&out, b"01Axyz6789\0\0!");

        let mut window = [0u8; 4];
        read_patched(
            10,
            |off, len| Ok(base[off as usize..off as usize + len].to_vec()),
            &patches,
            8,
            &mut window,
        )
        .unwrap();
        assert_eq!(&window, b"89\0\0");
    }

    #[test]
    fn emptiness_and_size() {
        let mut tier = Tier::default();
        assert!(tier.is_empty());
        tier.write(3, b"key", vec![0; 100]);
        assert!(!tier.is_empty());
        assert!(tier.approx_bytes() >= 103);
        assert_eq!(tier.indexes().count(), 1);
    }
}
