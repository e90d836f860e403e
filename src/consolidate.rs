// consolidate.rs — Host-side peak consolidation for mean-shift.
//
// The optimize kernel leaves one raw peak id per pixel. Ids are flattened
// pixel coordinates, so they are sparse and bounded only by the image size.
// Consolidation:
//
//   1. scans the ids once, collecting the unique ones in first-seen order
//      (the sentinel `UNSET_PEAK` is skipped),
//   2. gives the unique id of rank n the color `n * (2²⁴ / N)` split into
//      three 8-bit channels (red lowest), alpha opaque,
//   3. builds a `ColorTable` sorted by id so the coloring kernel can map
//      id → rank with a binary search instead of indexing by raw id.
//
// N = 0 is reported as `DegenerateConsolidation` before any division.

use std::collections::HashSet;

use crate::error::{Result, SegmentError};
use crate::image::ALPHA_MASK;
use crate::meanshift::UNSET_PEAK;

/// Number of distinct RGB values.
const COLOR_CUBE: u32 = 1 << 24;

/// Unique labelled ids of `peaks`, in first-seen order.
pub fn unique_peaks(peaks: &[u32]) -> Vec<u32> {
    let mut seen = HashSet::new();
    peaks
        .iter()
        .copied()
        .filter(|&id| id != UNSET_PEAK && seen.insert(id))
        .collect()
}

/// Display color of the unique id with the given rank among `count`.
///
/// Past 2²⁴ unique ids the step is pinned at 1 and colors wrap around the
/// cube, so distinct segments may share a color.
///
/// Panics if `count` is zero; callers go through [`consolidate`], which
/// rejects that case first.
#[inline]
pub fn color_for_rank(rank: usize, count: usize) -> u32 {
    let cube = u64::from(COLOR_CUBE);
    let step = (cube / count as u64).max(1);
    let rgb = (rank as u64).wrapping_mul(step) % cube;
    rgb as u32 | ALPHA_MASK
}

/// Peak id → color lookup, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorTable {
    keys: Vec<u32>,
    palette: Vec<u32>,
}

impl ColorTable {
    fn from_pairs(mut pairs: Vec<(u32, u32)>) -> Self {
        pairs.sort_unstable_by_key(|&(id, _)| id);
        let (keys, palette) = pairs.into_iter().unzip();
        ColorTable { keys, palette }
    }

    /// Color assigned to `id`, if it is a known peak.
    pub fn lookup(&self, id: u32) -> Option<u32> {
        self.keys.binary_search(&id).ok().map(|i| self.palette[i])
    }

    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    pub fn palette(&self) -> &[u32] {
        &self.palette
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Size in bytes of each of the two device tables.
    pub fn byte_size(&self) -> u64 {
        (self.keys.len() * std::mem::size_of::<u32>()) as u64
    }
}

/// Result of consolidating one peak buffer.
#[derive(Debug, Clone)]
pub struct Consolidation {
    /// Unique ids in first-seen order.
    pub unique: Vec<u32>,
    pub table: ColorTable,
}

impl Consolidation {
    /// Color of the unique id at `rank` in first-seen order.
    pub fn color_of_rank(&self, rank: usize) -> Option<u32> {
        self.unique.get(rank).and_then(|&id| self.table.lookup(id))
    }
}

/// Deduplicate `peaks` and assign each unique id a display color.
pub fn consolidate(peaks: &[u32]) -> Result<Consolidation> {
    let unique = unique_peaks(peaks);
    if unique.is_empty() {
        return Err(SegmentError::DegenerateConsolidation);
    }
    let count = unique.len();
    let pairs = unique
        .iter()
        .enumerate()
        .map(|(rank, &id)| (id, color_for_rank(rank, count)))
        .collect();
    Ok(Consolidation {
        unique,
        table: ColorTable::from_pairs(pairs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::unpack_rgba;

    #[test]
    fn test_unique_in_first_seen_order() {
        let peaks = [9, 4, 9, 100_000, 4, UNSET_PEAK, 2];
        assert_eq!(unique_peaks(&peaks), vec![9, 4, 100_000, 2]);
    }

    #[test]
    fn test_color_channels() {
        // Two peaks: step = 2²⁴ / 2 = 0x800000 → blue 0x80 for rank 1.
        assert_eq!(unpack_rgba(color_for_rank(0, 2)), [0, 0, 0, 255]);
        assert_eq!(unpack_rgba(color_for_rank(1, 2)), [0, 0, 0x80, 255]);
        // 2²⁴ peaks: every rank is its own RGB value.
        assert_eq!(unpack_rgba(color_for_rank(0x0302_01, 1 << 24)), [1, 2, 3, 255]);
    }

    #[test]
    fn test_more_ids_than_colors_wraps() {
        let count = (1 << 24) + 5;
        assert_eq!(unpack_rgba(color_for_rank(1, count)), [1, 0, 0, 255]);
        assert_eq!(color_for_rank((1 << 24) + 2, count), color_for_rank(2, count));
        assert_ne!(color_for_rank(count - 1, count), color_for_rank(count - 2, count));
    }

    #[test]
    fn test_table_is_sorted_and_rank_colored() {
        let c = consolidate(&[50, 7, 50, 300]).unwrap();
        assert_eq!(c.unique, vec![50, 7, 300]);
        assert_eq!(c.table.keys(), &[7, 50, 300]);
        assert_eq!(c.table.lookup(50), Some(color_for_rank(0, 3)));
        assert_eq!(c.table.lookup(7), Some(color_for_rank(1, 3)));
        assert_eq!(c.table.lookup(300), Some(color_for_rank(2, 3)));
        assert_eq!(c.table.lookup(8), None);
        assert_eq!(c.color_of_rank(2), Some(color_for_rank(2, 3)));
        assert_eq!(c.table.byte_size(), 12);
    }

    #[test]
    fn test_all_same_id() {
        let c = consolidate(&[42; 64]).unwrap();
        assert_eq!(c.unique, vec![42]);
        assert_eq!(c.table.len(), 1);
        assert_eq!(c.table.lookup(42), Some(ALPHA_MASK));
    }

    #[test]
    fn test_empty_and_all_unset_are_degenerate() {
        assert!(matches!(consolidate(&[]), Err(SegmentError::DegenerateConsolidation)));
        assert!(matches!(
            consolidate(&[UNSET_PEAK; 8]),
            Err(SegmentError::DegenerateConsolidation)
        ));
    }
}
