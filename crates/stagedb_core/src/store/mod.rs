//! Value storage: value files plus the deletion list that recycles them.
//!
//! Space is handed out from the deletion list first; only when no freed
//! range is large enough does a value go to the end of the last file.

mod free_list;
mod values;

pub use free_list::DeletionEntry;
pub(crate) use free_list::FreeList;
pub(crate) use values::ValueFiles;

use crate::error::CoreResult;
use crate::types::Locator;

/// Finds room for a value of `length` bytes.
pub(crate) fn allocate(
    free_list: &mut FreeList,
    values: &mut ValueFiles,
    length: u32,
) -> CoreResult<Locator> {
    if length == 0 {
        return Ok(Locator::empty());
    }
    let (file_id, offset) = match free_list.reserve(length) {
        Some(place) => place,
        None => values.append(length)?,
    };
    Ok(Locator::new(file_id, offset, length))
}

/// Returns a value's space to the deletion list.
pub(crate) fn release(free_list: &mut FreeList, locator: Locator) {
    if !locator.is_deleted() {
        free_list.release(locator.file_id, locator.offset, locator.length);
    }
}
