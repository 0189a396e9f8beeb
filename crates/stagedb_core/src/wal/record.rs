//! Undo log encoding.

use crate::codec::{corrupt_log, offset_u32, put_u16, put_u32, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::types::FileRef;

/// Size of the flag plus checksum that prefix the log body.
pub(crate) const LOG_PREFIX: usize = 5;

pub(crate) const FLAG_INACTIVE: u8 = 0;
pub(crate) const FLAG_ACTIVE: u8 = 1;

const KIND_DELETION: u8 = 0;
const KIND_VALUE: u8 = 1;
const KIND_INDEX: u8 = 2;

/// One write a commit will apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PhysicalWrite {
    pub target: FileRef,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl PhysicalWrite {
    pub(crate) fn new(target: FileRef, offset: u64, data: Vec<u8>) -> Self {
        Self {
            target,
            offset,
            data,
        }
    }
}

/// Append point of one index before the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexSnapshot {
    pub id: u16,
    pub last_file: u16,
    pub last_size: u32,
}

/// File sizes to cut back to when a commit is undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogSnapshot {
    pub deletion_count: u32,
    pub value_last_file: u16,
    pub value_last_size: u32,
    pub indexes: Vec<IndexSnapshot>,
}

/// Bytes that were at `offset` in `target` before the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogRecord {
    pub target: FileRef,
    pub offset: u32,
    pub previous: Vec<u8>,
}

fn encode_target(out: &mut Vec<u8>, target: FileRef) -> CoreResult<()> {
    let (kind, index, file) = match target {
        FileRef::Deletion => (KIND_DELETION, 0, 0),
        FileRef::Value(file) => (KIND_VALUE, 0, file),
        FileRef::Index { index, file } => (KIND_INDEX, index, file),
        FileRef::Log => {
            return Err(CoreError::invalid_argument(
                "the undo log cannot record writes to itself",
            ))
        }
    };
    out.push(kind);
    put_u16(out, index);
    put_u16(out, file);
    Ok(())
}

fn decode_target(reader: &mut ByteReader<'_>) -> CoreResult<FileRef> {
    let kind = reader.u8()?;
    let index = reader.u16()?;
    let file = reader.u16()?;
    match kind {
        KIND_DELETION => Ok(FileRef::Deletion),
        KIND_VALUE => Ok(FileRef::Value(file)),
        KIND_INDEX => Ok(FileRef::Index { index, file }),
        other => Err(CoreError::corrupt_log(format!("unknown file kind {other}"))),
    }
}

/// Encodes a complete log file with the flag cleared.
pub(crate) fn encode_log(snapshot: &LogSnapshot, records: &[LogRecord]) -> CoreResult<Vec<u8>> {
    let mut body = Vec::new();
    put_u32(&mut body, snapshot.deletion_count);
    put_u16(&mut body, snapshot.value_last_file);
    put_u32(&mut body, snapshot.value_last_size);
    let index_count = u16::try_from(snapshot.indexes.len())
        .map_err(|_| CoreError::invalid_argument("too many indexes in one commit"))?;
    put_u16(&mut body, index_count);
    for index in &snapshot.indexes {
        put_u16(&mut body, index.id);
        put_u16(&mut body, index.last_file);
        put_u32(&mut body, index.last_size);
    }

    for record in records {
        encode_target(&mut body, record.target)?;
        put_u32(&mut body, record.offset);
        put_u32(&mut body, offset_u32(record.previous.len() as u64)?);
        body.extend_from_slice(&record.previous);
    }

    let mut out = Vec::with_capacity(LOG_PREFIX + body.len());
    out.push(FLAG_INACTIVE);
    put_u32(&mut out, crc32fast::hash(&body));
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes an active log. The checksum must match the body exactly.
pub(crate) fn decode_log(data: &[u8]) -> CoreResult<(LogSnapshot, Vec<LogRecord>)> {
    if data.len() < LOG_PREFIX {
        return Err(CoreError::corrupt_log(format!(
            "log is active but only {} bytes long",
            data.len()
        )));
    }
    let mut prefix = ByteReader::new(&data[1..LOG_PREFIX], corrupt_log);
    let expected = prefix.u32()?;
    let body = &data[LOG_PREFIX..];
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CoreError::corrupt_log(format!(
            "checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }

    let mut reader = ByteReader::new(body, corrupt_log);
    let deletion_count = reader.u32()?;
    let value_last_file = reader.u16()?;
    let value_last_size = reader.u32()?;
    let index_count = reader.u16()?;
    let mut indexes = Vec::with_capacity(index_count as usize);
    for _ in 0..index_count {
        indexes.push(IndexSnapshot {
            id: reader.u16()?,
            last_file: reader.u16()?,
            last_size: reader.u32()?,
        });
    }

    let mut records = Vec::new();
    while reader.remaining() > 0 {
        let target = decode_target(&mut reader)?;
        let offset = reader.u32()?;
        let len = reader.u32()? as usize;
        let previous = reader.bytes(len)?.to_vec();
        records.push(LogRecord {
            target,
            offset,
            previous,
        });
    }

    Ok((
        LogSnapshot {
            deletion_count,
            value_last_file,
            value_last_size,
            indexes,
        },
        records,
    ))
}
