use std::fs;
use std::path::Path;

use crate::index::Index;
use crate::segment::parse_segment_id;
use crate::Result;

/// Lowest segment id to keep when at most `max_segments` segments ending at
/// `head_segment` are retained.
pub fn retention_floor(head_segment: u32, max_segments: u64) -> u32 {
    let keep = max_segments.max(1).min(u64::from(head_segment) + 1);
    head_segment - (keep - 1) as u32
}

/// Deletes every segment older than the retention window and drops it from
/// the index. The head segment is never deleted, and neither is any segment
/// at or after the oldest one still holding an unresolved reservation.
/// Returns the deleted ids.
///
/// Tailers of this process that still hold an evicted segment keep reading
/// it through their mapping; seeks into it afterwards fail with
/// `IndexEvicted`.
pub fn cleanup_segments(
    root: &Path,
    index: &Index,
    head_segment: u32,
    max_segments: u64,
) -> Result<Vec<u32>> {
    let mut floor = retention_floor(head_segment, max_segments);
    if let Some(pending) = index.first_incomplete_id() {
        if pending < floor {
            log::debug!(
                "retention held at segment {}: reservations still open",
                pending
            );
            floor = pending;
        }
    }
    let mut deleted: Vec<u32> = index
        .evict_before(floor)
        .iter()
        .map(|segment| segment.id())
        .collect();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("q") {
            continue;
        }
        let id = match path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_segment_id)
        {
            Some(id) => id,
            None => continue,
        };
        if id < floor {
            fs::remove_file(&path)?;
            log::debug!("evicted segment {} ({})", id, path.display());
            deleted.push(id);
        }
    }

    deleted.sort_unstable();
    deleted.dedup();
    Ok(deleted)
}
