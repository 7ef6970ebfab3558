//! Half-open intervals over absolute TCP sequence numbers

use serde::{Deserialize, Serialize};

/// Linear scan is fine for the typical handful of ranges per direction.
/// Very large rule sets switch to a binary search for the first candidate.
const BINARY_SEARCH_THRESHOLD: usize = 10_000;

/// A half-open range `[start, end)` of absolute sequence numbers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct SeqRange {
    pub start: u64,
    pub end: u64,
}

impl SeqRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Two half-open ranges overlap iff `self.end > other.start && other.end > self.start`
    pub fn overlaps(&self, other: &SeqRange) -> bool {
        self.end > other.start && other.end > self.start
    }

    /// Like [`overlaps`](Self::overlaps), but also true for ranges sharing an endpoint
    pub fn overlaps_or_touches(&self, other: &SeqRange) -> bool {
        self.end >= other.start && other.end >= self.start
    }

    /// The common sub-range, if any
    pub fn intersect(&self, other: &SeqRange) -> Option<SeqRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(SeqRange { start, end })
        } else {
            None
        }
    }

    /// The smallest range containing both inputs
    pub fn union_span(&self, other: &SeqRange) -> SeqRange {
        SeqRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Sort ranges and merge every overlapping or adjacent pair.
///
/// Empty input yields empty output. The result is sorted by `start` and
/// pairwise disjoint with at least one byte between consecutive ranges.
pub fn coalesce(mut ranges: Vec<SeqRange>) -> Vec<SeqRange> {
    if ranges.is_empty() {
        return ranges;
    }
    ranges.sort();

    let mut merged: Vec<SeqRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// All ranges of `sorted` overlapping `probe`.
///
/// `sorted` must be ordered by `start` and have non-decreasing ends, which
/// holds for both list shapes stored per flow direction: coalesced ranges
/// are disjoint, and header-only ranges all have the same width.
pub fn overlapping(sorted: &[SeqRange], probe: SeqRange) -> Vec<SeqRange> {
    overlapping_impl(sorted, probe, BINARY_SEARCH_THRESHOLD)
}

fn overlapping_impl(sorted: &[SeqRange], probe: SeqRange, threshold: usize) -> Vec<SeqRange> {
    if sorted.is_empty() || probe.is_empty() {
        return Vec::new();
    }

    let first_candidate = if sorted.len() > threshold {
        // First range whose end lies past the probe start
        sorted.partition_point(|range| range.end <= probe.start)
    } else {
        0
    };

    let mut found = Vec::new();
    for range in &sorted[first_candidate..] {
        if range.start >= probe.end {
            break;
        }
        if range.overlaps(&probe) {
            found.push(*range);
        }
    }
    found
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn r(start: u64, end: u64) -> SeqRange {
        SeqRange::new(start, end)
    }

    #[test]
    fn test_overlap_rules() {
        assert!(r(0, 10).overlaps(&r(9, 20)));
        assert!(r(9, 20).overlaps(&r(0, 10)));
        assert!(r(0, 10).overlaps(&r(0, 10)));
        // Touching ranges share no byte
        assert!(!r(0, 10).overlaps(&r(10, 20)));
        assert!(r(0, 10).overlaps_or_touches(&r(10, 20)));
        assert!(!r(0, 10).overlaps(&r(11, 20)));
    }

    #[test]
    fn test_intersect() {
        assert_eq!(Some(r(5, 10)), r(0, 10).intersect(&r(5, 20)));
        assert_eq!(Some(r(3, 4)), r(3, 4).intersect(&r(0, 100)));
        assert_eq!(None, r(0, 10).intersect(&r(10, 20)));
    }

    #[test]
    fn test_coalesce() {
        assert_eq!(
            vec![r(0, 20), r(30, 40)],
            coalesce(vec![r(10, 20), r(0, 10), r(30, 40), r(5, 15)])
        );
        // Adjacent ranges merge as well
        assert_eq!(vec![r(0, 30)], coalesce(vec![r(0, 10), r(10, 20), r(20, 30)]));
        assert_eq!(Vec::<SeqRange>::new(), coalesce(vec![]));
    }

    #[test]
    fn test_overlapping_linear() {
        let ranges = vec![r(0, 5), r(10, 15), r(20, 25), r(30, 35)];
        assert_eq!(vec![r(10, 15), r(20, 25)], overlapping(&ranges, r(12, 22)));
        assert_eq!(Vec::<SeqRange>::new(), overlapping(&ranges, r(5, 10)));
        assert_eq!(vec![r(0, 5)], overlapping(&ranges, r(4, 5)));
    }

    #[test]
    fn test_overlapping_binary_search_matches_linear() {
        let ranges: Vec<_> = (0..100).map(|i| r(i * 10, i * 10 + 5)).collect();
        for probe in &[r(0, 1000), r(42, 77), r(995, 2000), r(7, 10)] {
            assert_eq!(
                overlapping_impl(&ranges, *probe, usize::max_value()),
                overlapping_impl(&ranges, *probe, 0),
                "probe {:?}",
                probe
            );
        }
    }
}
