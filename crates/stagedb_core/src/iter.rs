//! Range iteration over the committed state of an index.
//!
//! An iterator only remembers the key it stands on. Every step is a fresh
//! seek from that key, so it keeps working across commits; entries
//! committed or removed meanwhile are seen or skipped accordingly.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::index::{lookup, seek, IndexEntry, Seek};
use crate::types::IndexHandle;
use crate::value::{Base, ValueRef};

/// Cursor over the keys of one index within `[min, max]`.
///
/// Starts unpositioned; call [`first`](Self::first) or
/// [`last`](Self::last) before stepping.
pub struct RangeIterator<'db> {
    db: &'db Database,
    index: IndexHandle,
    min: Vec<u8>,
    max: Vec<u8>,
    current: Option<IndexEntry>,
}

impl Database {
    /// Creates an iterator over the committed keys in `[min, max]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeySize` if either bound has the wrong width.
    pub fn range(&self, index: IndexHandle, min: &[u8], max: &[u8]) -> CoreResult<RangeIterator<'_>> {
        for bound in [min, max] {
            if bound.len() != index.key_size() {
                return Err(CoreError::InvalidKeySize {
                    expected: index.key_size(),
                    actual: bound.len(),
                });
            }
        }
        Ok(RangeIterator {
            db: self,
            index,
            min: min.to_vec(),
            max: max.to_vec(),
            current: None,
        })
    }
}

impl<'db> RangeIterator<'db> {
    fn in_range(&self, key: &[u8]) -> bool {
        (self.min.as_slice()..=self.max.as_slice()).contains(&key)
    }

    fn seek(&self, key: &[u8], mode: Seek) -> CoreResult<Option<IndexEntry>> {
        let found = self
            .db
            .with_disk(self.index, |disk, tree| seek(&tree.view(&disk.files), key, mode))?;
        Ok(found.filter(|e| self.in_range(&e.key)))
    }

    /// Seeks and reads the value found, both under one disk lock.
    fn seek_with_value(&self, key: &[u8], mode: Seek) -> CoreResult<Option<(IndexEntry, Vec<u8>)>> {
        self.db.with_disk(self.index, |disk, tree| {
            let Some(entry) =
                seek(&tree.view(&disk.files), key, mode)?.filter(|e| self.in_range(&e.key))
            else {
                return Ok(None);
            };
            let value = ValueRef::new(
                Base::Disk {
                    files: &disk.files,
                    locator: entry.locator,
                },
                Vec::new(),
            )
            .to_vec()?;
            Ok(Some((entry, value)))
        })
    }

    fn step(&mut self, found: Option<IndexEntry>) -> bool {
        match found {
            Some(entry) => {
                self.current = Some(entry);
                true
            }
            None => false,
        }
    }

    /// Moves to the smallest key in range. Returns false if there is none.
    pub fn first(&mut self) -> CoreResult<bool> {
        let found = self.seek(&self.min, Seek::AtOrAfter)?;
        Ok(self.step(found))
    }

    /// Moves to the greatest key in range. Returns false if there is none.
    pub fn last(&mut self) -> CoreResult<bool> {
        let found = self.seek(&self.max, Seek::AtOrBefore)?;
        Ok(self.step(found))
    }

    /// Moves to the next key. Returns false, staying put, at the end of the
    /// range or when unpositioned.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> CoreResult<bool> {
        let Some(current) = &self.current else {
            return Ok(false);
        };
        let found = self.seek(&current.key, Seek::After)?;
        Ok(self.step(found))
    }

    /// Moves to the previous key. Returns false, staying put, at the start
    /// of the range or when unpositioned.
    pub fn previous(&mut self) -> CoreResult<bool> {
        let Some(current) = &self.current else {
            return Ok(false);
        };
        let found = self.seek(&current.key, Seek::Before)?;
        Ok(self.step(found))
    }

    /// The key the iterator stands on.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.key.as_slice())
    }

    /// Length of the value as of the last step.
    #[must_use]
    pub fn length(&self) -> Option<u32> {
        self.current.as_ref().map(|e| e.locator.length)
    }

    /// Reads the committed value of the current key from `offset`.
    ///
    /// Returns false if unpositioned or if the entry was rewritten or
    /// removed since the last step; [`length`](Self::length) is only
    /// trusted while this returns true.
    ///
    /// # Errors
    ///
    /// Returns `ReadOutOfBounds` if the range runs past the value.
    pub fn read(&self, out: &mut [u8], offset: u32) -> CoreResult<bool> {
        let Some(current) = &self.current else {
            return Ok(false);
        };
        self.db.with_disk(self.index, |disk, tree| {
            let view = tree.view(&disk.files);
            if lookup(&view, &current.key)? != Some(current.locator) {
                return Ok(false);
            }
            let value = ValueRef::new(
                Base::Disk {
                    files: &disk.files,
                    locator: current.locator,
                },
                Vec::new(),
            );
            value.read(offset, out)?;
            Ok(true)
        })
    }

    /// Turns the cursor into an iterator of `(key, value)` pairs in
    /// ascending order, starting from the first key in range.
    #[must_use]
    pub fn entries(self) -> RangeEntries<'db> {
        RangeEntries {
            cursor: self,
            started: false,
            done: false,
        }
    }
}

/// Ascending `(key, value)` pairs of a range.
pub struct RangeEntries<'db> {
    cursor: RangeIterator<'db>,
    started: bool,
    done: bool,
}

impl RangeEntries<'_> {
    fn advance(&mut self) -> CoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let cursor = &self.cursor;
        let found = if self.started {
            match &cursor.current {
                Some(current) => cursor.seek_with_value(&current.key, Seek::After)?,
                None => None,
            }
        } else {
            self.started = true;
            cursor.seek_with_value(&cursor.min, Seek::AtOrAfter)?
        };
        let Some((entry, value)) = found else {
            return Ok(None);
        };
        let key = entry.key.clone();
        self.cursor.current = Some(entry);
        Ok(Some((key, value)))
    }
}

impl Iterator for RangeEntries<'_> {
    type Item = CoreResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, Database};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn db_with(keys: &[u16]) -> (Database, crate::IndexHandle) {
        let db = Database::open_in_memory(Config::default().index_node_elements(4)).unwrap();
        let idx = db.load_index(3, 2, 1 << 16).unwrap();
        for &k in keys {
            db.write_value(idx, &k.to_be_bytes(), &k.to_le_bytes()).unwrap();
        }
        db.stage().unwrap();
        db.commit().unwrap();
        (db, idx)
    }

    #[test]
    fn walk_forward_and_back() {
        let (db, idx) = db_with(&[10, 20, 30, 40]);
        let mut it = db.range(idx, &15u16.to_be_bytes(), &40u16.to_be_bytes()).unwrap();
        assert!(!it.next().unwrap());

        assert!(it.first().unwrap());
        assert_eq!(it.key(), Some(&20u16.to_be_bytes()[..]));
        assert!(it.next().unwrap());
        assert!(it.next().unwrap());
        assert_eq!(it.key(), Some(&40u16.to_be_bytes()[..]));
        assert!(!it.next().unwrap());
        assert_eq!(it.key(), Some(&40u16.to_be_bytes()[..]));

        assert!(it.previous().unwrap());
        assert!(it.previous().unwrap());
        assert_eq!(it.key(), Some(&20u16.to_be_bytes()[..]));
        assert!(!it.previous().unwrap());

        assert!(it.last().unwrap());
        assert_eq!(it.length(), Some(2));
        let mut out = [0u8; 2];
        assert!(it.read(&mut out, 0).unwrap());
        assert_eq!(out, 40u16.to_le_bytes());
    }

    #[test]
    fn empty_range() {
        let (db, idx) = db_with(&[10, 20]);
        let mut it = db.range(idx, &11u16.to_be_bytes(), &19u16.to_be_bytes()).unwrap();
        assert!(!it.first().unwrap());
        assert!(!it.last().unwrap());
        assert_eq!(it.key(), None);
    }

    #[test]
    fn uncommitted_changes_are_invisible() {
        let (db, idx) = db_with(&[1, 2]);
        db.write_value(idx, &3u16.to_be_bytes(), b"x").unwrap();
        db.remove_value(idx, &1u16.to_be_bytes()).unwrap();
        let keys: Vec<_> = db
            .range(idx, &0u16.to_be_bytes(), &u16::MAX.to_be_bytes())
            .unwrap()
            .entries()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![1u16.to_be_bytes().to_vec(), 2u16.to_be_bytes().to_vec()]);
    }

    #[test]
    fn cursor_survives_commit() {
        let (db, idx) = db_with(&[1, 2, 3]);
        let mut it = db.range(idx, &0u16.to_be_bytes(), &9u16.to_be_bytes()).unwrap();
        assert!(it.first().unwrap());

        db.remove_value(idx, &2u16.to_be_bytes()).unwrap();
        db.write_value(idx, &4u16.to_be_bytes(), b"new").unwrap();
        db.stage().unwrap();
        db.commit().unwrap();

        let mut out = [0u8; 2];
        assert!(it.read(&mut out, 0).unwrap());
        assert!(it.next().unwrap());
        assert_eq!(it.key(), Some(&3u16.to_be_bytes()[..]));
        assert!(it.next().unwrap());
        assert_eq!(it.key(), Some(&4u16.to_be_bytes()[..]));
    }

    #[test]
    fn read_refuses_entry_rewritten_since_step() {
        let (db, idx) = db_with(&[1, 2]);
        let mut it = db.range(idx, &0u16.to_be_bytes(), &9u16.to_be_bytes()).unwrap();
        assert!(it.first().unwrap());
        assert_eq!(it.length(), Some(2));

        db.write_value(idx, &1u16.to_be_bytes(), b"much longer").unwrap();
        db.stage().unwrap();
        db.commit().unwrap();

        let mut out = [0u8; 2];
        assert!(!it.read(&mut out, 0).unwrap());
        assert!(it.first().unwrap());
        assert_eq!(it.length(), Some(11));
        let mut out = [0u8; 11];
        assert!(it.read(&mut out, 0).unwrap());
        assert_eq!(&out, b"much longer");
    }

    #[test]
    fn bounds_must_match_key_size() {
        let (db, idx) = db_with(&[]);
        assert!(db.range(idx, b"a", b"zz").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn matches_sorted_scan(
            inserts in proptest::collection::vec(0u16..300, 1..120),
            removes in proptest::collection::vec(0u16..300, 0..60),
            lo in 0u16..300,
            span in 0u16..300,
        ) {
            let (db, idx) = db_with(&inserts);
            for k in &removes {
                db.remove_value(idx, &k.to_be_bytes()).unwrap();
            }
            db.stage().unwrap();
            db.commit().unwrap();

            let mut model: BTreeMap<u16, ()> = inserts.iter().map(|&k| (k, ())).collect();
            for k in &removes {
                model.remove(k);
            }
            let hi = lo.saturating_add(span);
            let expected: Vec<u16> = model.range(lo..=hi).map(|(k, _)| *k).collect();

            let forward: Vec<u16> = db
                .range(idx, &lo.to_be_bytes(), &hi.to_be_bytes())
                .unwrap()
                .entries()
                .map(|r| {
                    let (key, value) = r.unwrap();
                    let k = u16::from_be_bytes([key[0], key[1]]);
                    assert_eq!(value, k.to_le_bytes());
                    k
                })
                .collect();
            prop_assert_eq!(&forward, &expected);

            let mut it = db.range(idx, &lo.to_be_bytes(), &hi.to_be_bytes()).unwrap();
            let mut backward = Vec::new();
            if it.last().unwrap() {
                loop {
                    let key = it.key().unwrap();
                    backward.push(u16::from_be_bytes([key[0], key[1]]));
                    if !it.previous().unwrap() {
                        break;
                    }
                }
            }
            backward.reverse();
            prop_assert_eq!(backward, expected);
        }
    }
}
