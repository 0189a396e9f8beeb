//! Deletion list: freed value ranges available for reuse.
//!
//! ## File Format
//!
//! ```text
//! | count (4) | count × slot (11) |
//! slot = | active (1) | length (4) | file_id (2) | offset (4) |
//! ```
//!
//! Slots are never removed. A consumed range flips to inactive and its
//! slot is handed to the next release, so the file only grows when every
//! slot is in use.

use crate::codec::{corruption, put_u16, put_u32, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::types::FileRef;
use crate::wal::PhysicalWrite;
use std::collections::BTreeSet;

const COUNT_SIZE: usize = 4;
const SLOT_SIZE: usize = 11;

/// A freed byte range in a value file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionEntry {
    /// Whether the range may be reused.
    pub active: bool,
    /// Length of the free range.
    pub length: u32,
    /// Value file id.
    pub file_id: u16,
    /// Offset of the range within the file.
    pub offset: u32,
}

impl DeletionEntry {
    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut out = Vec::with_capacity(SLOT_SIZE);
        out.push(u8::from(self.active));
        put_u32(&mut out, self.length);
        put_u16(&mut out, self.file_id);
        put_u32(&mut out, self.offset);
        let mut slot = [0u8; SLOT_SIZE];
        slot.copy_from_slice(&out);
        slot
    }
}

/// In-memory deletion list mirroring `del.dat`.
#[derive(Debug, Clone, Default)]
pub(crate) struct FreeList {
    slots: Vec<DeletionEntry>,
    /// Active ranges ordered by size: (length, file, offset, slot).
    available: BTreeSet<(u32, u16, u32, usize)>,
    inactive: BTreeSet<usize>,
    dirty: BTreeSet<usize>,
    persisted_slots: usize,
}

impl FreeList {
    /// Contents of a fresh `del.dat`.
    pub(crate) fn initial_file() -> Vec<u8> {
        0u32.to_le_bytes().to_vec()
    }

    /// Size of `del.dat` holding `count` slots.
    pub(crate) fn file_size(count: u32) -> u64 {
        (COUNT_SIZE + count as usize * SLOT_SIZE) as u64
    }

    pub(crate) fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(data, corruption);
        let count = reader.u32()? as usize;
        if reader.remaining() < count * SLOT_SIZE {
            return Err(CoreError::corruption(format!(
                "deletion list holds {} bytes for {count} slots",
                reader.remaining()
            )));
        }

        let mut list = Self {
            persisted_slots: count,
            ..Self::default()
        };
        for slot in 0..count {
            let active = match reader.u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(CoreError::corruption(format!(
                        "deletion slot {slot} has active flag {other}"
                    )))
                }
            };
            let entry = DeletionEntry {
                active,
                length: reader.u32()?,
                file_id: reader.u16()?,
                offset: reader.u32()?,
            };
            list.slots.push(entry);
            list.index_slot(slot);
        }
        Ok(list)
    }

    fn index_slot(&mut self, slot: usize) {
        let entry = self.slots[slot];
        if entry.active {
            self.available
                .insert((entry.length, entry.file_id, entry.offset, slot));
        } else {
            self.inactive.insert(slot);
        }
    }

    fn unindex_slot(&mut self, slot: usize) {
        let entry = self.slots[slot];
        if entry.active {
            self.available
                .remove(&(entry.length, entry.file_id, entry.offset, slot));
        } else {
            self.inactive.remove(&slot);
        }
    }

    fn set_slot(&mut self, slot: usize, entry: DeletionEntry) {
        if slot == self.slots.len() {
            self.slots.push(entry);
        } else {
            self.unindex_slot(slot);
            self.slots[slot] = entry;
        }
        self.index_slot(slot);
        self.dirty.insert(slot);
    }

    /// Number of slots, active or not.
    pub(crate) fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of slots holding reusable space.
    pub(crate) fn active_count(&self) -> usize {
        self.available.len()
    }

    pub(crate) fn entries(&self) -> &[DeletionEntry] {
        &self.slots
    }

    /// Takes `length` bytes from the largest active range, if it is big
    /// enough.
    ///
    /// The leftover stays active in the same slot, starting right after the
    /// taken bytes.
    pub(crate) fn reserve(&mut self, length: u32) -> Option<(u16, u32)> {
        if length == 0 {
            return None;
        }
        let &(stored, file_id, offset, slot) = self.available.last()?;
        if stored < length {
            return None;
        }

        let remainder = stored - length;
        let entry = if remainder == 0 {
            DeletionEntry {
                active: false,
                length: 0,
                file_id,
                offset,
            }
        } else {
            DeletionEntry {
                active: true,
                length: remainder,
                file_id,
                offset: offset + length,
            }
        };
        self.set_slot(slot, entry);
        Some((file_id, offset))
    }

    /// Returns a range to the list.
    pub(crate) fn release(&mut self, file_id: u16, offset: u32, length: u32) {
        if length == 0 {
            return;
        }
        let slot = self
            .inactive
            .first()
            .copied()
            .unwrap_or(self.slots.len());
        self.set_slot(
            slot,
            DeletionEntry {
                active: true,
                length,
                file_id,
                offset,
            },
        );
    }

    /// Emits the writes that bring `del.dat` in line with memory.
    pub(crate) fn take_writes(&mut self) -> Vec<PhysicalWrite> {
        let mut writes = Vec::new();
        if self.slots.len() != self.persisted_slots {
            writes.push(PhysicalWrite::new(
                FileRef::Deletion,
                0,
                self.count().to_le_bytes().to_vec(),
            ));
            self.persisted_slots = self.slots.len();
        }
        for slot in std::mem::take(&mut self.dirty) {
            writes.push(PhysicalWrite::new(
                FileRef::Deletion,
                (COUNT_SIZE + slot * SLOT_SIZE) as u64,
                self.slots[slot].encode().to_vec(),
            ));
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(file: &mut Vec<u8>, writes: &[PhysicalWrite]) {
        for w in writes {
            let end = w.offset as usize + w.data.len();
            if file.len() < end {
                file.resize(end, 0);
            }
            file[w.offset as usize..end].copy_from_slice(&w.data);
        }
    }

    #[test]
    fn reserve_takes_largest_range_and_keeps_remainder() {
        let mut list = FreeList::default();
        list.release(0, 10, 50);
        list.release(0, 68, 20);

        assert_eq!(list.reserve(10), Some((0, 10)));
        assert_eq!(
            list.entries()[0],
            DeletionEntry {
                active: true,
                length: 40,
                file_id: 0,
                offset: 20,
            }
        );
        assert_eq!(list.active_count(), 2);
    }

    #[test]
    fn reserve_fails_when_largest_range_is_too_small() {
        let mut list = FreeList::default();
        list.release(0, 100, 50);
        list.release(0, 300, 20);
        list.release(1, 0, 30);

        assert_eq!(list.reserve(60), None);
        assert_eq!(list.reserve(30), Some((0, 100)));
        assert_eq!(list.reserve(25), Some((1, 0)));
        assert_eq!(list.reserve(20), Some((0, 300)));
        assert_eq!(list.active_count(), 2);
        assert_eq!(list.reserve(20), Some((0, 130)));
        assert_eq!(list.active_count(), 1);
    }

    #[test]
    fn release_reuses_inactive_slot() {
        let mut list = FreeList::default();
        list.release(0, 10, 8);
        list.release(0, 40, 8);
        assert_eq!(list.reserve(8), Some((0, 40)));
        assert_eq!(list.count(), 2);

        list.release(2, 0, 4);
        assert_eq!(list.count(), 2);
        assert_eq!(list.entries()[1].file_id, 2);
        assert!(list.entries()[1].active);
    }

    #[test]
    fn zero_length_is_ignored() {
        let mut list = FreeList::default();
        list.release(0, 10, 0);
        assert_eq!(list.count(), 0);
        list.release(0, 10, 4);
        assert_eq!(list.reserve(0), None);
        assert_eq!(list.active_count(), 1);
    }

    #[test]
    fn writes_round_trip_through_file_image() {
        let mut file = FreeList::initial_file();
        let mut list = FreeList::decode(&file).unwrap();

        list.release(0, 64, 32);
        list.release(3, 8, 16);
        list.reserve(32);
        apply(&mut file, &list.take_writes());
        assert!(list.take_writes().is_empty());
        assert_eq!(file.len() as u64, FreeList::file_size(2));

        let loaded = FreeList::decode(&file).unwrap();
        assert_eq!(loaded.entries(), list.entries());
        assert_eq!(loaded.active_count(), 1);
    }

    #[test]
    fn decode_rejects_short_file() {
        let mut file = 2u32.to_le_bytes().to_vec();
        file.extend_from_slice(&[1; SLOT_SIZE]);
        assert!(matches!(
            FreeList::decode(&file),
            Err(CoreError::Corruption { .. })
        ));
    }
}
