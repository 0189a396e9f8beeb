//! Writing, finalizing and replaying the undo log.

use crate::error::{CoreError, CoreResult};
use crate::files::FileSet;
use crate::store::FreeList;
use crate::types::FileRef;
use crate::wal::record::{
    decode_log, encode_log, LogRecord, LogSnapshot, PhysicalWrite, FLAG_ACTIVE, FLAG_INACTIVE,
};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Logs the bytes every write in `writes` will replace, then marks the
/// log active.
///
/// Only bytes inside a file's current length are logged. Anything past it
/// is removed by truncating back to the snapshot sizes.
pub(crate) fn write_undo_log(
    files: &mut FileSet,
    snapshot: &LogSnapshot,
    writes: &[PhysicalWrite],
) -> CoreResult<()> {
    let mut records = Vec::with_capacity(writes.len());
    for write in writes {
        let size = files.size(write.target)?;
        if write.offset >= size || write.data.is_empty() {
            continue;
        }
        let end = (write.offset + write.data.len() as u64).min(size);
        let previous = files.read(write.target, write.offset, (end - write.offset) as usize)?;
        records.push(LogRecord {
            target: write.target,
            offset: crate::codec::offset_u32(write.offset)?,
            previous,
        });
    }

    let bytes = encode_log(snapshot, &records)?;
    debug!(
        records = records.len(),
        bytes = bytes.len(),
        "writing undo log"
    );

    files.truncate(FileRef::Log, 0)?;
    files.write(FileRef::Log, 0, &bytes)?;
    files.sync(FileRef::Log)?;
    files.write(FileRef::Log, 0, &[FLAG_ACTIVE])?;
    files.sync(FileRef::Log)?;
    Ok(())
}

/// Marks the log inactive and empties it.
///
/// The commit is durable once the cleared flag is synced. Failing to empty
/// the log after that only leaves an inactive log, which the next open or
/// commit discards.
pub(crate) fn finalize(files: &mut FileSet) -> CoreResult<()> {
    files.write(FileRef::Log, 0, &[FLAG_INACTIVE])?;
    files.sync(FileRef::Log)?;
    if let Err(err) = files
        .truncate(FileRef::Log, 0)
        .and_then(|()| files.sync(FileRef::Log))
    {
        warn!(error = %err, "could not empty the inactive log");
    }
    Ok(())
}

/// Undoes an interrupted commit if the log is active.
///
/// Returns true if a rollback was performed. Safe to run again after a
/// crash part way through.
pub(crate) fn recover(files: &mut FileSet) -> CoreResult<bool> {
    if !files.exists(FileRef::Log) {
        return Ok(false);
    }
    let data = files.read_all(FileRef::Log)?;
    match data.first() {
        None => return Ok(false),
        Some(&FLAG_INACTIVE) => {
            // Crashed before the flag was set or after it was cleared.
            files.truncate(FileRef::Log, 0)?;
            return Ok(false);
        }
        Some(&FLAG_ACTIVE) => {}
        Some(other) => {
            return Err(CoreError::corrupt_log(format!("unknown log flag {other}")));
        }
    }

    let (snapshot, records) = decode_log(&data)?;
    info!(
        records = records.len(),
        indexes = snapshot.indexes.len(),
        "undo log is active, rolling back interrupted commit"
    );
    rollback(files, &snapshot, &records)?;
    finalize(files)?;
    info!("rollback complete");
    Ok(true)
}

/// Cuts every file back to the snapshot and restores logged bytes, newest
/// record first.
fn rollback(files: &mut FileSet, snapshot: &LogSnapshot, records: &[LogRecord]) -> CoreResult<()> {
    let mut touched = BTreeSet::new();
    let mut removed = BTreeSet::new();

    if files.exists(FileRef::Deletion) {
        files.truncate(
            FileRef::Deletion,
            FreeList::file_size(snapshot.deletion_count),
        )?;
        touched.insert(FileRef::Deletion);
    }

    cut_back(
        files,
        FileRef::Value,
        snapshot.value_last_file,
        snapshot.value_last_size,
        &mut touched,
        &mut removed,
    )?;
    for index in &snapshot.indexes {
        let id = index.id;
        cut_back(
            files,
            |file| FileRef::Index { index: id, file },
            index.last_file,
            index.last_size,
            &mut touched,
            &mut removed,
        )?;
    }

    for record in records.iter().rev() {
        if removed.contains(&record.target) {
            continue;
        }
        files.write(record.target, u64::from(record.offset), &record.previous)?;
        touched.insert(record.target);
    }

    for file in touched {
        files.sync(file)?;
    }
    files.opener().sync_dir()?;
    Ok(())
}

fn cut_back(
    files: &mut FileSet,
    file_ref: impl Fn(u16) -> FileRef,
    last_file: u16,
    last_size: u32,
    touched: &mut BTreeSet<FileRef>,
    removed: &mut BTreeSet<FileRef>,
) -> CoreResult<()> {
    let last = file_ref(last_file);
    if files.exists(last) {
        files.truncate(last, u64::from(last_size))?;
        touched.insert(last);
    }

    let mut next = last_file.checked_add(1);
    while let Some(n) = next {
        let file = file_ref(n);
        if !files.exists(file) {
            break;
        }
        debug!(%file, "removing file created by the interrupted commit");
        files.remove(file)?;
        removed.insert(file);
        next = n.checked_add(1);
    }
    Ok(())
}
