use crate::state::{FileInfo, Segment, SegmentPlan};

const MB: u64 = 1024 * 1024;

/// Number of segments for a ranged download of `total_size` bytes.
pub fn segment_count(total_size: u64, max_parallelism: usize) -> usize {
    let max = max_parallelism.max(1);
    if total_size < 5 * MB {
        1
    } else if total_size < 50 * MB {
        max.min(2)
    } else if total_size < 100 * MB {
        max.min(3)
    } else {
        max
    }
}

/// Splits a resource into equally sized segments, the last one possibly shorter.
///
/// Resources without range support always get a single segment. Segments that
/// would start past the end of the resource are not planned.
pub fn plan(info: &FileInfo, max_parallelism: usize) -> SegmentPlan {
    let total = info.total_size;

    if !info.supports_range || total == 0 {
        return SegmentPlan::new(vec![Segment::new(0, 0..total)], total, false);
    }

    let count = segment_count(total, max_parallelism) as u64;
    let chunk_size = total.div_ceil(count);

    let segments = (0..count)
        .map(|i| i * chunk_size)
        .take_while(|&start| start < total)
        .enumerate()
        .map(|(index, start)| Segment::new(index, start..(start + chunk_size).min(total)))
        .collect();

    SegmentPlan::new(segments, total, true)
}
