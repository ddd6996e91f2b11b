//! Slice boundaries, shared by the sender and the receiver.

use std::ops::Range;

/// Number of slices needed to carry `len` bytes.
pub fn slice_count(len: u64, slice_size: u64) -> u64 {
    len.div_ceil(slice_size)
}

/// Byte range of slice `index`: `slice_size` bytes from `index * slice_size`,
/// except the last slice, which stops at `len`.
pub fn slice_range(index: u64, len: u64, slice_size: u64) -> Range<u64> {
    let start = index.saturating_mul(slice_size).min(len);
    let end = start.saturating_add(slice_size).min(len);
    start..end
}

/// Every `(index, range)` pair for a buffer of `len` bytes.
pub fn slices(len: u64, slice_size: u64) -> impl Iterator<Item = (u64, Range<usize>)> {
    (0..slice_count(len, slice_size)).map(move |index| {
        let range = slice_range(index, len, slice_size);
        (index, range.start as usize..range.end as usize)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thirteen_bytes_in_fours() {
        let ranges: Vec<_> = slices(13, 4).map(|(_, r)| r).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..12, 12..13]);
    }

    #[test]
    fn ten_bytes_in_fours() {
        let ranges: Vec<_> = slices(10, 4).map(|(_, r)| r).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn ranges_tile_the_buffer() {
        for slice_size in [1u64, 3, 4, 7] {
            let c = slice_size;
            for len in [0, 1, c - 1, c, c + 1, 10 * c, 10 * c + 1] {
                let mut next = 0usize;
                for (_, range) in slices(len, slice_size) {
                    assert_eq!(range.start, next);
                    assert!(range.end > range.start);
                    assert!((range.end - range.start) as u64 <= slice_size);
                    next = range.end;
                }
                assert_eq!(next as u64, len);
            }
        }
    }

    #[test]
    fn empty_buffer_has_no_slices() {
        assert_eq!(slice_count(0, 4), 0);
        assert_eq!(slices(0, 4).count(), 0);
    }
}
