//! Little-endian field encoding shared by every on-disk structure.

use crate::error::{CoreError, CoreResult};

/// Cursor over an encoded buffer.
///
/// Short reads are reported through the constructor's error builder so the
/// log parser can surface `CorruptLog` while file headers surface
/// `Corruption`.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    error: fn(String) -> CoreError,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8], error: fn(String) -> CoreError) -> Self {
        Self {
            data,
            pos: 0,
            error,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err((self.error)(format!(
                "need {len} bytes at offset {}, only {} remain",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

pub(crate) fn corruption(message: String) -> CoreError {
    CoreError::corruption(message)
}

pub(crate) fn corrupt_log(message: String) -> CoreError {
    CoreError::corrupt_log(message)
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Converts a file position to the 32-bit offsets used on disk.
pub(crate) fn offset_u32(value: u64) -> CoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| CoreError::invalid_argument(format!("offset {value} exceeds 32 bits")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fields_in_order() {
        let mut buf = vec![9u8];
        put_u16(&mut buf, 0xBEEF);
        put_u32(&mut buf, 70_000);
        buf.extend_from_slice(b"xy");

        let mut reader = ByteReader::new(&buf, corruption);
        assert_eq!(reader.u8().unwrap(), 9);
        assert_eq!(reader.u16().unwrap(), 0xBEEF);
        assert_eq!(reader.u32().unwrap(), 70_000);
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.bytes(2).unwrap(), b"xy");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn short_read_uses_error_builder() {
        let mut reader = ByteReader::new(&[1, 2], corrupt_log);
        assert!(matches!(reader.u32(), Err(CoreError::CorruptLog { .. })));

        let mut reader = ByteReader::new(&[], corruption);
        assert!(matches!(reader.u8(), Err(CoreError::Corruption { .. })));
    }

    #[test]
    fn offset_conversion() {
        assert_eq!(offset_u32(12).unwrap(), 12);
        assert!(offset_u32(u64::from(u32::MAX) + 1).is_err());
    }
}
