//! Reading a value as the tiers see it.

use crate::error::{CoreError, CoreResult};
use crate::files::FileSet;
use crate::transaction::{patched_len, read_patched, Patch};
use crate::types::{FileRef, Locator};

/// Where the unpatched bytes of a value come from.
pub(crate) enum Base<'a> {
    Empty,
    Memory(&'a [u8]),
    Disk { files: &'a FileSet, locator: Locator },
}

impl Base<'_> {
    fn len(&self) -> u32 {
        match self {
            Self::Empty => 0,
            Self::Memory(bytes) => bytes.len() as u32,
            Self::Disk { locator, .. } => locator.length,
        }
    }

    fn read(&self, offset: u32, len: usize) -> CoreResult<Vec<u8>> {
        match self {
            Self::Empty => Ok(vec![0; len]),
            Self::Memory(bytes) => {
                let start = offset as usize;
                Ok(bytes[start..start + len].to_vec())
            }
            Self::Disk { files, locator } => files.read(
                FileRef::Value(locator.file_id),
                u64::from(locator.offset) + u64::from(offset),
                len,
            ),
        }
    }
}

/// A resolved value: a base plus the patches layered on it.
pub(crate) struct ValueRef<'a> {
    base: Base<'a>,
    patches: Vec<&'a Patch>,
}

impl<'a> ValueRef<'a> {
    pub(crate) fn new(base: Base<'a>, patches: Vec<&'a Patch>) -> Self {
        Self { base, patches }
    }

    pub(crate) fn len(&self) -> CoreResult<u32> {
        let len = patched_len(self.base.len(), &self.patches);
        u32::try_from(len)
            .map_err(|_| CoreError::corruption(format!("value length {len} overflows")))
    }

    /// Fills `out` from `offset`; the range must lie inside the value.
    pub(crate) fn read(&self, offset: u32, out: &mut [u8]) -> CoreResult<()> {
        let length = self.len()?;
        if u64::from(offset) + out.len() as u64 > u64::from(length) {
            return Err(CoreError::ReadOutOfBounds {
                offset,
                len: out.len(),
                length,
            });
        }
        read_patched(
            self.base.len(),
            |off, len| self.base.read(off, len),
            &self.patches,
            offset,
            out,
        )
    }

    pub(crate) fn to_vec(&self) -> CoreResult<Vec<u8>> {
        let mut out = vec![0; self.len()? as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_base_with_patch() {
        let patch = Patch {
            offset: 4,
            bytes: b"!!".to_vec(),
        };
        let value = ValueRef::new(Base::Memory(b"abc"), vec![&patch]);
        assert_eq!(value.len().unwrap(), 6);
        assert_eq!(value.to_vec().unwrap(), b"abc\0!!");

        let mut out = [0u8; 2];
        value.read(1, &mut out).unwrap();
        assert_eq!(&out, b"bc");
    }

    #[test]
    fn read_past_end_is_an_error() {
        let value = ValueRef::new(Base::Memory(b"abc"), Vec::new());
        let mut out = [0u8; 2];
        assert!(matches!(
            value.read(2, &mut out),
            Err(CoreError::ReadOutOfBounds {
                offset: 2,
                len: 2,
                length: 3
            })
        ));
        let mut empty = [0u8; 0];
        value.read(3, &mut empty).unwrap();
    }

    #[test]
    fn empty_base() {
        let patch = Patch {
            offset: 1,
            bytes: b"x".to_vec(),
        };
        let value = ValueRef::new(Base::Empty, vec![&patch]);
        assert_eq!(value.to_vec().unwrap(), b"\0x");
    }
}
