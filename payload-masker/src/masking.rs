//! Applying keep rules to one TCP payload
//!
//! The default is mask-everything: the output buffer starts as filler bytes
//! and only bytes covered by a keep rule are copied back from the source.
//! Header-only rules apply first and mark their positions; full-preserve
//! rules fill in the rest without touching marked positions, so the exact
//! 5-byte header geometry always wins over a broader range that happens to
//! overlap it.

use crate::rule_index::DirectionRules;
use keep_rules::{interval, SeqRange};

#[derive(Debug, Eq, PartialEq)]
pub struct MaskOutcome {
    pub payload: Vec<u8>,
    pub preserved_bytes: u64,
    pub masked_bytes: u64,
}

/// Rewrite one payload according to the rules of its flow direction.
///
/// `segment` is the absolute sequence range `[seq, seq + len(payload))` the
/// payload occupies. With no rules every byte becomes `mask_byte`.
pub fn apply_keep_rules(
    payload: &[u8],
    segment: SeqRange,
    rules: Option<&DirectionRules>,
    mask_byte: u8,
) -> MaskOutcome {
    let mut buffer = vec![mask_byte; payload.len()];
    let mut preserved_map = vec![false; payload.len()];
    let mut preserved_bytes = 0u64;

    if let Some(rules) = rules {
        for range in interval::overlapping(&rules.header_only, segment) {
            preserved_bytes += copy_range(payload, segment, range, &mut buffer, &mut preserved_map);
        }
        for range in interval::overlapping(&rules.full_preserve, segment) {
            preserved_bytes += copy_range(payload, segment, range, &mut buffer, &mut preserved_map);
        }
    }

    MaskOutcome {
        masked_bytes: payload.len() as u64 - preserved_bytes,
        preserved_bytes,
        payload: buffer,
    }
}

/// Copy the intersection of `range` and `segment` from the source into the
/// buffer, skipping positions already preserved. Returns the number of newly
/// preserved bytes.
fn copy_range(
    payload: &[u8],
    segment: SeqRange,
    range: SeqRange,
    buffer: &mut [u8],
    preserved_map: &mut [bool],
) -> u64 {
    let overlap = match range.intersect(&segment) {
        Some(overlap) => overlap,
        None => return 0,
    };
    let left = (overlap.start - segment.start) as usize;
    let right = (overlap.end - segment.start) as usize;

    let mut newly_preserved = 0u64;
    for position in left..right.min(payload.len()) {
        if !preserved_map[position] {
            buffer[position] = payload[position];
            preserved_map[position] = true;
            newly_preserved += 1;
        }
    }
    newly_preserved
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rules(header_only: Vec<SeqRange>, full_preserve: Vec<SeqRange>) -> DirectionRules {
        DirectionRules {
            header_only,
            full_preserve,
        }
    }

    #[test]
    fn test_no_rules_masks_everything() {
        let outcome = apply_keep_rules(&[0xde, 0xad, 0xbe, 0xef], SeqRange::new(100, 104), None, 0);
        assert_eq!(vec![0, 0, 0, 0], outcome.payload);
        assert_eq!(4, outcome.masked_bytes);
        assert_eq!(0, outcome.preserved_bytes);
    }

    #[test]
    fn test_empty_rules_mask_with_configured_byte() {
        let rules = rules(vec![], vec![]);
        let outcome = apply_keep_rules(&[1, 2, 3], SeqRange::new(0, 3), Some(&rules), 0xcc);
        assert_eq!(vec![0xcc, 0xcc, 0xcc], outcome.payload);
    }

    #[test]
    fn test_header_rule_preserves_record_header_only() {
        // TLS-23 record: 5-byte header declaring a 5-byte body
        let payload = [0x17, 0x03, 0x03, 0x00, 0x05, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let rules = rules(vec![SeqRange::new(1000, 1005)], vec![]);

        let outcome = apply_keep_rules(&payload, SeqRange::new(1000, 1010), Some(&rules), 0);
        assert_eq!(
            vec![0x17, 0x03, 0x03, 0x00, 0x05, 0, 0, 0, 0, 0],
            outcome.payload
        );
        assert_eq!(5, outcome.preserved_bytes);
        assert_eq!(5, outcome.masked_bytes);
    }

    #[test]
    fn test_rule_clipped_to_segment() {
        let payload = [1u8, 2, 3, 4];
        // Rule starts before and ends after the segment
        let rules = rules(vec![], vec![SeqRange::new(0, 100)]);
        let outcome = apply_keep_rules(&payload, SeqRange::new(10, 14), Some(&rules), 0);
        assert_eq!(vec![1, 2, 3, 4], outcome.payload);
        assert_eq!(4, outcome.preserved_bytes);
    }

    #[test]
    fn test_header_and_full_rules_count_overlap_once() {
        let payload = [9u8; 20];
        // A cross-segment full rule overlapping the whole record; the header
        // rule claims its 5 bytes first
        let rules = rules(
            vec![SeqRange::new(100, 105)],
            vec![SeqRange::new(100, 120)],
        );
        let outcome = apply_keep_rules(&payload, SeqRange::new(100, 120), Some(&rules), 0);
        assert_eq!(vec![9u8; 20], outcome.payload);
        assert_eq!(20, outcome.preserved_bytes);
        assert_eq!(0, outcome.masked_bytes);
    }

    #[test]
    fn test_disjoint_rules_leave_gap_masked() {
        let payload = [7u8; 10];
        let rules = rules(vec![], vec![SeqRange::new(0, 3), SeqRange::new(7, 10)]);
        let outcome = apply_keep_rules(&payload, SeqRange::new(0, 10), Some(&rules), 0);
        assert_eq!(vec![7, 7, 7, 0, 0, 0, 0, 7, 7, 7], outcome.payload);
        assert_eq!(6, outcome.preserved_bytes);
        assert_eq!(4, outcome.masked_bytes);
    }

    #[test]
    fn test_rule_outside_segment_changes_nothing() {
        let payload = [5u8; 4];
        let rules = rules(vec![], vec![SeqRange::new(1000, 1010)]);
        let outcome = apply_keep_rules(&payload, SeqRange::new(0, 4), Some(&rules), 0);
        assert_eq!(vec![0, 0, 0, 0], outcome.payload);
    }

    #[test]
    fn test_empty_payload() {
        let outcome = apply_keep_rules(&[], SeqRange::new(5, 5), None, 0);
        assert!(outcome.payload.is_empty());
        assert_eq!(0, outcome.preserved_bytes);
        assert_eq!(0, outcome.masked_bytes);
    }
}
