//! Value files and the header carried by `val_0.dat`.
//!
//! ## Header
//!
//! ```text
//! | last_file (2) | last_size (4) | extra_len (4) | extra data (extra_len) |
//! ```
//!
//! `last_file`/`last_size` mark the append point. Values start right after
//! the header in file 0 and at offset 0 in later files.

use crate::codec::{corruption, put_u16, put_u32, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::types::FileRef;
use crate::wal::PhysicalWrite;

const FIXED_HEADER: u32 = 10;

/// Append cursor and extra data for the value files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValueFiles {
    last_file: u16,
    last_size: u32,
    extra: Vec<u8>,
    max_file_size: u32,
}

impl ValueFiles {
    /// State of a new database: one value file holding only the header.
    pub(crate) fn new(extra_size: u32, max_file_size: u32) -> Self {
        let extra = vec![0; extra_size as usize];
        Self {
            last_file: 0,
            last_size: FIXED_HEADER + extra_size,
            extra,
            max_file_size,
        }
    }

    /// Bytes needed to learn the header length.
    pub(crate) const fn fixed_header_len() -> usize {
        FIXED_HEADER as usize
    }

    /// Reads the header length from its fixed prefix.
    pub(crate) fn header_len_from(prefix: &[u8]) -> CoreResult<usize> {
        let mut reader = ByteReader::new(prefix, corruption);
        reader.bytes(6)?;
        Ok(FIXED_HEADER as usize + reader.u32()? as usize)
    }

    pub(crate) fn decode(header: &[u8], max_file_size: u32) -> CoreResult<Self> {
        let mut reader = ByteReader::new(header, corruption);
        let last_file = reader.u16()?;
        let last_size = reader.u32()?;
        let extra_len = reader.u32()?;
        let extra = reader.bytes(extra_len as usize)?.to_vec();

        if last_file == 0 && last_size < FIXED_HEADER + extra_len {
            return Err(CoreError::corruption(format!(
                "value file append point {last_size} lies inside the header"
            )));
        }

        Ok(Self {
            last_file,
            last_size,
            extra,
            max_file_size,
        })
    }

    pub(crate) fn encode_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() as usize);
        put_u16(&mut out, self.last_file);
        put_u32(&mut out, self.last_size);
        put_u32(&mut out, self.extra.len() as u32);
        out.extend_from_slice(&self.extra);
        out
    }

    pub(crate) fn header_write(&self) -> PhysicalWrite {
        PhysicalWrite::new(FileRef::Value(0), 0, self.encode_header())
    }

    pub(crate) fn header_len(&self) -> u32 {
        FIXED_HEADER + self.extra.len() as u32
    }

    pub(crate) fn last_file(&self) -> u16 {
        self.last_file
    }

    pub(crate) fn last_size(&self) -> u32 {
        self.last_size
    }

    pub(crate) fn extra(&self) -> &[u8] {
        &self.extra
    }

    /// Replaces the extra data, keeping its fixed size.
    pub(crate) fn set_extra(&mut self, data: &[u8]) {
        let n = data.len().min(self.extra.len());
        self.extra[..n].copy_from_slice(&data[..n]);
        self.extra[n..].fill(0);
    }

    fn file_start(&self, file: u16) -> u32 {
        if file == 0 {
            self.header_len()
        } else {
            0
        }
    }

    /// Reserves `length` bytes at the end of the last file, rolling over to
    /// a new file once `max_file_size` would be exceeded.
    pub(crate) fn append(&mut self, length: u32) -> CoreResult<(u16, u32)> {
        let fits = self
            .last_size
            .checked_add(length)
            .is_some_and(|end| end <= self.max_file_size);

        if !fits && self.last_size > self.file_start(self.last_file) {
            self.last_file = self.last_file.checked_add(1).ok_or_else(|| {
                CoreError::invalid_argument("value files exhausted the 16-bit file id space")
            })?;
            self.last_size = 0;
        }

        let offset = self.last_size;
        self.last_size = offset.checked_add(length).ok_or_else(|| {
            CoreError::invalid_argument(format!("value of {length} bytes does not fit in a file"))
        })?;
        Ok((self.last_file, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut values = ValueFiles::new(4, u32::MAX);
        values.set_extra(b"ab");
        values.append(20).unwrap();

        let header = values.encode_header();
        assert_eq!(header.len() as u32, values.header_len());
        assert_eq!(
            ValueFiles::header_len_from(&header[..ValueFiles::fixed_header_len()]).unwrap(),
            header.len()
        );

        let decoded = ValueFiles::decode(&header, u32::MAX).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(decoded.extra(), b"ab\0\0");
        assert_eq!(decoded.last_size(), 14 + 20);
    }

    #[test]
    fn append_rolls_over() {
        let mut values = ValueFiles::new(0, 32);
        assert_eq!(values.append(16).unwrap(), (0, 10));
        assert_eq!(values.append(16).unwrap(), (1, 0));
        assert_eq!(values.append(16).unwrap(), (1, 16));
        assert_eq!(values.append(40).unwrap(), (2, 0));
        assert_eq!(values.last_file(), 2);
        assert_eq!(values.last_size(), 40);
    }

    #[test]
    fn extra_data_is_fixed_size() {
        let mut values = ValueFiles::new(3, u32::MAX);
        values.set_extra(b"abcdef");
        assert_eq!(values.extra(), b"abc");
        values.set_extra(b"z");
        assert_eq!(values.extra(), b"z\0\0");
    }

    #[test]
    fn decode_rejects_append_point_inside_header() {
        let mut values = ValueFiles::new(8, u32::MAX);
        values.last_size = 4;
        assert!(ValueFiles::decode(&values.encode_header(), u32::MAX).is_err());
    }
}
