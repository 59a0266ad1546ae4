use crate::{BlobError, BlobResult, PartSpec};

/// Split `total_size` bytes into parts of `part_size`.
///
/// Every part but the last is exactly `part_size`; the last holds the
/// remainder, or a full part when the size divides evenly. Part numbers are
/// `offset / part_size + 1`, so they run `1..=n` with no gaps.
pub fn plan_parts(total_size: u64, part_size: u64) -> BlobResult<Vec<PartSpec>> {
    if total_size == 0 {
        return Err(BlobError::invalid("cannot upload an empty object"));
    }
    if part_size == 0 {
        return Err(BlobError::invalid("part size must be positive"));
    }

    let count = total_size.div_ceil(part_size);
    let count = u32::try_from(count)
        .map_err(|_| BlobError::invalid(format!("{} parts is more than a u32 can number", count)))?;

    let mut parts = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    while offset < total_size {
        let len = part_size.min(total_size - offset);
        parts.push(PartSpec {
            part_number: (offset / part_size) as u32 + 1,
            offset,
            len,
        });
        offset += len;
    }
    Ok(parts)
}
