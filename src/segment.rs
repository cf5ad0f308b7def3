use std::ops::Range;

/// A contiguous range of the target's virtual address space mapped to an
/// offset within the backing store.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Segment {
    /// The first virtual address covered by the segment.
    pub va: u64,
    /// The number of bytes the segment covers.
    pub len: u64,
    /// The backing store offset of the first byte of the segment.
    pub file_offset: u64,
}

impl Segment {
    /// Create a new [Segment].
    pub fn new(va: u64, len: u64, file_offset: u64) -> Self {
        Self {
            va,
            len,
            file_offset,
        }
    }

    #[inline]
    /// The first virtual address past the end of the segment.
    pub fn end(&self) -> u64 {
        self.va + self.len
    }

    #[inline]
    /// Returns `true` if `va` lies within the segment.
    pub fn contains(&self, va: u64) -> bool {
        self.va <= va && va < self.end()
    }

    #[inline]
    pub(crate) fn file_offset_of(&self, va: u64) -> u64 {
        debug_assert!(self.contains(va));
        self.file_offset + (va - self.va)
    }
}

/// The backing store geometry of a single cache page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PageSpan {
    /// The backing store offset of the first byte of the page.
    pub file_offset: u64,
    /// The number of mapped bytes in the page, at most one page size.
    pub len: usize,
}

#[derive(Debug, thiserror::Error)]
/// The provided segments do not describe a valid address space.
pub enum SegmentMapError {
    #[error("segment at va {0:#x} has zero length")]
    /// A segment with a length of zero was provided.
    EmptySegment(u64),
    #[error("segment at va {0:#x} overlaps the previous segment")]
    /// Two segments cover overlapping virtual address ranges.
    Overlap(u64),
    #[error("segment at va {0:#x} overflows the address space")]
    /// A segment's end address does not fit in 64 bits.
    Overflow(u64),
}

/// An immutable, ordered collection of [Segment]s describing how the
/// target's virtual address space maps onto the backing store.
///
/// Lookups are a binary search over the sorted segment list. The map is
/// created once when the cache is opened and never mutated afterwards.
pub struct SegmentMap {
    segments: Box<[Segment]>,
}

impl SegmentMap {
    /// Create a new [SegmentMap] from the given segments.
    ///
    /// The segments are sorted by their start address, they do not need to
    /// be provided in order. Overlapping and zero-length segments are
    /// rejected.
    pub fn new(mut segments: Vec<Segment>) -> Result<Self, SegmentMapError> {
        segments.sort_by_key(|segment| segment.va);

        let mut last_end = 0u64;
        for segment in segments.iter() {
            if segment.len == 0 {
                return Err(SegmentMapError::EmptySegment(segment.va));
            }

            if segment.va.checked_add(segment.len).is_none() {
                return Err(SegmentMapError::Overflow(segment.va));
            }

            if segment.va < last_end {
                return Err(SegmentMapError::Overlap(segment.va));
            }
            last_end = segment.end();
        }

        Ok(Self {
            segments: segments.into_boxed_slice(),
        })
    }

    /// Find the segment containing `va`.
    ///
    /// Returns the index of the segment and the offset of `va` within it.
    pub fn find(&self, va: u64) -> Option<(usize, u64)> {
        let index = self
            .segments
            .partition_point(|segment| segment.va <= va)
            .checked_sub(1)?;

        let segment = &self.segments[index];
        segment.contains(va).then_some((index, va - segment.va))
    }

    /// Iterate each `(segment, sub-range)` pair intersecting the given
    /// virtual address range, in address order.
    ///
    /// A range straddling a gap between segments yields only the covered
    /// sub-ranges. Callers that require contiguity must stop at the first
    /// gap themselves.
    pub fn iter_range(
        &self,
        range: Range<u64>,
    ) -> impl Iterator<Item = (&Segment, Range<u64>)> + '_ {
        let (range_start, range_end) = (range.start, range.end);
        let start = self
            .segments
            .partition_point(|segment| segment.end() <= range_start);

        self.segments[start..]
            .iter()
            .take_while(move |segment| segment.va < range_end)
            .map(move |segment| {
                let sub_start = segment.va.max(range_start);
                let sub_end = segment.end().min(range_end);
                (segment, sub_start..sub_end)
            })
    }

    /// Compute the geometry of the page starting at the page-aligned
    /// address `base`.
    ///
    /// Returns `None` if `base` itself is not contained in any segment. The
    /// last page of a segment may be shorter than `page_size`.
    pub(crate) fn page_span(&self, base: u64, page_size: u64) -> Option<PageSpan> {
        let (index, _) = self.find(base)?;
        let segment = &self.segments[index];
        let len = page_size.min(segment.end() - base);
        Some(PageSpan {
            file_offset: segment.file_offset_of(base),
            len: len as usize,
        })
    }

    #[inline]
    /// Returns the segments of the map, ordered by start address.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    /// Returns the number of segments in the map.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    /// Returns `true` if the map contains no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> SegmentMap {
        SegmentMap::new(vec![
            Segment::new(0x1000, 0x1000, 0),
            Segment::new(0x3000, 0x1000, 0x1000),
            Segment::new(0x8000, 0x400, 0x2000),
        ])
        .unwrap()
    }

    #[rstest::rstest]
    #[case::first_byte(0x1000, Some((0, 0)))]
    #[case::inside_first(0x1234, Some((0, 0x234)))]
    #[case::last_byte_of_first(0x1FFF, Some((0, 0xFFF)))]
    #[case::gap(0x2000, None)]
    #[case::second(0x3000, Some((1, 0)))]
    #[case::below_all(0x0, None)]
    #[case::past_all(0x9000, None)]
    fn test_find(#[case] va: u64, #[case] expected: Option<(usize, u64)>) {
        let map = sample_map();
        assert_eq!(map.find(va), expected);
    }

    #[test]
    fn test_segments_are_sorted() {
        let map = SegmentMap::new(vec![
            Segment::new(0x3000, 0x1000, 0x1000),
            Segment::new(0x1000, 0x1000, 0),
        ])
        .unwrap();
        assert_eq!(map.segments()[0].va, 0x1000);
        assert_eq!(map.segments()[1].va, 0x3000);
    }

    #[test]
    fn test_rejects_overlap() {
        let result = SegmentMap::new(vec![
            Segment::new(0x1000, 0x1000, 0),
            Segment::new(0x1800, 0x1000, 0x1000),
        ]);
        assert!(matches!(result, Err(SegmentMapError::Overlap(0x1800))));
    }

    #[test]
    fn test_rejects_empty_segment() {
        let result = SegmentMap::new(vec![Segment::new(0x1000, 0, 0)]);
        assert!(matches!(result, Err(SegmentMapError::EmptySegment(0x1000))));
    }

    #[test]
    fn test_rejects_overflowing_segment() {
        let result = SegmentMap::new(vec![Segment::new(u64::MAX - 10, 100, 0)]);
        assert!(matches!(
            result,
            Err(SegmentMapError::Overflow(va)) if va == u64::MAX - 10,
        ));
    }

    #[test]
    fn test_iter_range_straddles_gap() {
        let map = sample_map();

        let covered = map.iter_range(0x1F00..0x3100).collect::<Vec<_>>();
        assert_eq!(covered.len(), 2);
        assert_eq!(covered[0].1, 0x1F00..0x2000);
        assert_eq!(covered[1].1, 0x3000..0x3100);
    }

    #[test]
    fn test_iter_range_empty_when_unmapped() {
        let map = sample_map();
        assert_eq!(map.iter_range(0x2000..0x2800).count(), 0);
        assert_eq!(map.iter_range(0..0x1000).count(), 0);
    }

    #[rstest::rstest]
    #[case::aligned_interior(0x1000, PageSpan { file_offset: 0, len: 0x1000 })]
    #[case::second_segment(0x3000, PageSpan { file_offset: 0x1000, len: 0x1000 })]
    #[case::short_tail(0x8000, PageSpan { file_offset: 0x2000, len: 0x400 })]
    fn test_page_span(#[case] base: u64, #[case] expected: PageSpan) {
        let map = sample_map();
        assert_eq!(map.page_span(base, 0x1000), Some(expected));
    }

    #[test]
    fn test_page_span_unmapped_base() {
        let map = sample_map();
        assert_eq!(map.page_span(0x2000, 0x1000), None);
    }
}
