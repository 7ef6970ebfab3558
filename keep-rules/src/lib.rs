//! Data model shared between the TLS analyzer and the payload rewriter
//!
//! The analyzer produces a [`KeepRuleSet`]: per TCP stream and direction, the
//! absolute-sequence byte ranges which must survive masking, each tagged with
//! the TLS record kind it came from and a [`PreserveStrategy`]. The rewriter
//! consumes the set read-only; nothing in here mutates across the module
//! boundary.
//!
//! Sequence numbers are the raw 32-bit values from the wire, widened to
//! `u64`. A rule matches a packet only within the same 32-bit epoch; flows
//! which wrap during a capture are not matched across the wrap.

pub mod flow;
pub mod interval;

pub use crate::{
    flow::{Direction, Endpoint, FlowKey, FlowTable, StreamId},
    interval::SeqRange,
};

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of the TLS record header: content type, version, body length
pub const TLS_RECORD_HEADER_LEN: u64 = 5;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RuleError {
    #[error("keep rule range is empty or inverted: [{start}, {end})")]
    EmptyRange { start: u64, end: u64 },
}

/// How the bytes of a rule relate to the record they came from
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreserveStrategy {
    /// Only the 5-byte record header survives; the body is masked
    HeaderOnly,
    /// Header and body both survive
    FullPreserve,
}

/// Provenance tag of a keep rule
///
/// The serialized names match the rendered tags, so fixtures and reports use
/// the same vocabulary.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum RuleKind {
    #[serde(rename = "tls_changecipherspec")]
    TlsChangeCipherSpec,
    #[serde(rename = "tls_alert")]
    TlsAlert,
    #[serde(rename = "tls_handshake")]
    TlsHandshake,
    #[serde(rename = "tls_applicationdata")]
    TlsApplicationData,
    /// Header-only rule for an ApplicationData record whose body is masked
    #[serde(rename = "tls_applicationdata_header")]
    TlsApplicationDataHeader,
    #[serde(rename = "tls_heartbeat")]
    TlsHeartbeat,
    #[serde(rename = "tls_unknown")]
    TlsUnknown(u8),
    /// Result of merging rules of different kinds
    #[serde(rename = "tls_mixed")]
    Mixed,
}

impl RuleKind {
    /// Map a TLS content type to the kind of a full-record rule
    pub fn from_content_type(content_type: u8) -> Self {
        match content_type {
            20 => RuleKind::TlsChangeCipherSpec,
            21 => RuleKind::TlsAlert,
            22 => RuleKind::TlsHandshake,
            23 => RuleKind::TlsApplicationData,
            24 => RuleKind::TlsHeartbeat,
            other => RuleKind::TlsUnknown(other),
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::TlsChangeCipherSpec => f.write_str("tls_changecipherspec"),
            RuleKind::TlsAlert => f.write_str("tls_alert"),
            RuleKind::TlsHandshake => f.write_str("tls_handshake"),
            RuleKind::TlsApplicationData => f.write_str("tls_applicationdata"),
            RuleKind::TlsApplicationDataHeader => f.write_str("tls_applicationdata_header"),
            RuleKind::TlsHeartbeat => f.write_str("tls_heartbeat"),
            RuleKind::TlsUnknown(t) => write!(f, "tls_unknown_{}", t),
            RuleKind::Mixed => f.write_str("tls_mixed"),
        }
    }
}

/// An interval of bytes to preserve within one direction of one TCP stream
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct KeepRule {
    pub stream_id: StreamId,
    pub direction: Direction,
    pub seq: SeqRange,
    pub kind: RuleKind,
    pub strategy: PreserveStrategy,
    /// TLS content type of the originating record
    pub content_type: u8,
    /// Frame number the record was reported in, for debugging with wireshark
    pub frame: u32,
}

impl KeepRule {
    pub fn new(
        stream_id: StreamId,
        direction: Direction,
        seq: SeqRange,
        kind: RuleKind,
        strategy: PreserveStrategy,
        content_type: u8,
        frame: u32,
    ) -> Result<Self, RuleError> {
        if seq.is_empty() {
            return Err(RuleError::EmptyRange {
                start: seq.start,
                end: seq.end,
            });
        }
        Ok(Self {
            stream_id,
            direction,
            seq,
            kind,
            strategy,
            content_type,
            frame,
        })
    }

    /// Rule covering a whole record: header plus body
    pub fn full_record(
        stream_id: StreamId,
        direction: Direction,
        record_start: u64,
        record_length: u64,
        content_type: u8,
        frame: u32,
    ) -> Result<Self, RuleError> {
        Self::new(
            stream_id,
            direction,
            SeqRange::new(
                record_start,
                record_start + TLS_RECORD_HEADER_LEN + record_length,
            ),
            RuleKind::from_content_type(content_type),
            PreserveStrategy::FullPreserve,
            content_type,
            frame,
        )
    }

    /// Header-only rule for an ApplicationData record
    pub fn application_data_header(
        stream_id: StreamId,
        direction: Direction,
        record_start: u64,
        frame: u32,
    ) -> Result<Self, RuleError> {
        Self::new(
            stream_id,
            direction,
            SeqRange::new(record_start, record_start + TLS_RECORD_HEADER_LEN),
            RuleKind::TlsApplicationDataHeader,
            PreserveStrategy::HeaderOnly,
            23,
            frame,
        )
    }

    /// Length of the preserved interval in bytes
    pub fn len(&self) -> u64 {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Try to merge with another rule.
    ///
    /// Rules merge only within the same stream and direction, when their
    /// ranges overlap or touch, and when the strategies are compatible:
    /// header-only rules keep their exact 5-byte geometry and never merge
    /// with full-preserve rules, nor with each other unless `merge_headers`
    /// is set.
    pub fn merge_with(&self, other: &KeepRule, merge_headers: bool) -> Option<KeepRule> {
        if self.stream_id != other.stream_id || self.direction != other.direction {
            return None;
        }
        if !self.seq.overlaps_or_touches(&other.seq) {
            return None;
        }
        if self.strategy != other.strategy {
            return None;
        }
        if self.strategy == PreserveStrategy::HeaderOnly && !merge_headers {
            return None;
        }

        Some(KeepRule {
            stream_id: self.stream_id,
            direction: self.direction,
            seq: self.seq.union_span(&other.seq),
            kind: if self.kind == other.kind {
                self.kind
            } else {
                RuleKind::Mixed
            },
            strategy: self.strategy,
            content_type: self.content_type,
            frame: self.frame.min(other.frame),
        })
    }
}

/// Per-stream summary recorded alongside the rules
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FlowInfo {
    pub stream_id: StreamId,
    /// Sender of the first packet of the flow
    pub forward_source: Endpoint,
    pub forward_destination: Endpoint,
    pub packet_count: u64,
    pub byte_count: u64,
}

/// The analyzer's complete output for one capture file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeepRuleSet {
    rules: Vec<KeepRule>,
    flows: FnvHashMap<StreamId, FlowInfo>,
    /// Degradation notes, e.g. a dissector failure. Surfaced as stage
    /// warnings; a non-empty list with zero rules means "mask everything".
    annotations: Vec<String>,
}

impl KeepRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set carrying an explanation of why analysis produced nothing
    pub fn degraded(annotation: impl Into<String>) -> Self {
        let mut set = Self::default();
        set.annotations.push(annotation.into());
        set
    }

    pub fn add_rule(&mut self, rule: KeepRule) {
        self.rules.push(rule);
    }

    pub fn add_flow(&mut self, info: FlowInfo) {
        self.flows.insert(info.stream_id, info);
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        self.annotations.push(note.into());
    }

    pub fn rules(&self) -> &[KeepRule] {
        &self.rules
    }

    pub fn flows(&self) -> &FnvHashMap<StreamId, FlowInfo> {
        &self.flows
    }

    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    /// Rules of one flow direction, in emission order
    pub fn rules_for(
        &self,
        stream_id: StreamId,
        direction: Direction,
    ) -> impl Iterator<Item = &KeepRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.stream_id == stream_id && rule.direction == direction)
    }

    /// Sum of the raw rule lengths; overlapping rules count twice
    pub fn total_preserved_bytes(&self) -> u64 {
        self.rules.iter().map(KeepRule::len).sum()
    }

    pub fn stream_count(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Consistency checks, returning one message per problem found
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.is_empty() {
                problems.push(format!(
                    "rule {}: empty range [{}, {})",
                    idx, rule.seq.start, rule.seq.end
                ));
            }
            if rule.strategy == PreserveStrategy::HeaderOnly
                && rule.len() != TLS_RECORD_HEADER_LEN
            {
                problems.push(format!(
                    "rule {}: header-only rule covers {} bytes instead of {}",
                    idx,
                    rule.len(),
                    TLS_RECORD_HEADER_LEN
                ));
            }
            if !self.flows.contains_key(&rule.stream_id) {
                problems.push(format!(
                    "rule {}: no flow info for stream {}",
                    idx, rule.stream_id
                ));
            }
        }
        problems
    }
}

/// Merge overlapping and adjacent rules with compatible strategies.
///
/// Not applied by the analyzer by default; callers opt in. Header-only rules
/// are kept as-is unless `merge_headers` is set.
pub fn merge_rules(rules: &[KeepRule], merge_headers: bool) -> Vec<KeepRule> {
    let mut sorted: Vec<KeepRule> = rules.to_vec();
    sorted.sort_by_key(|rule| (rule.stream_id, rule.direction, rule.seq.start, rule.seq.end));

    let mut merged: Vec<KeepRule> = Vec::with_capacity(sorted.len());
    for rule in sorted {
        if let Some(last) = merged.last_mut() {
            if let Some(combined) = last.merge_with(&rule, merge_headers) {
                *last = combined;
                continue;
            }
        }
        merged.push(rule);
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn full(stream: u64, direction: Direction, start: u64, len: u64) -> KeepRule {
        KeepRule::full_record(StreamId(stream), direction, start, len, 22, 1).unwrap()
    }

    fn header(stream: u64, direction: Direction, start: u64) -> KeepRule {
        KeepRule::application_data_header(StreamId(stream), direction, start, 1).unwrap()
    }

    #[test]
    fn test_rule_construction() {
        let rule = full(0, Direction::Forward, 1000, 200);
        assert_eq!(SeqRange::new(1000, 1205), rule.seq);
        assert_eq!(RuleKind::TlsHandshake, rule.kind);
        assert_eq!(PreserveStrategy::FullPreserve, rule.strategy);

        let rule = header(0, Direction::Reverse, 500);
        assert_eq!(SeqRange::new(500, 505), rule.seq);
        assert_eq!(RuleKind::TlsApplicationDataHeader, rule.kind);
        assert_eq!(PreserveStrategy::HeaderOnly, rule.strategy);
    }

    #[test]
    fn test_rejects_empty_range() {
        let err = KeepRule::new(
            StreamId(0),
            Direction::Forward,
            SeqRange::new(10, 10),
            RuleKind::TlsHandshake,
            PreserveStrategy::FullPreserve,
            22,
            1,
        )
        .unwrap_err();
        assert_eq!(RuleError::EmptyRange { start: 10, end: 10 }, err);
    }

    #[test]
    fn test_merge_compatibility() {
        let a = full(0, Direction::Forward, 0, 10);
        let b = full(0, Direction::Forward, 15, 10);
        // [0, 15) and [15, 30) touch
        let merged = a.merge_with(&b, false).unwrap();
        assert_eq!(SeqRange::new(0, 30), merged.seq);

        // Header rules never merge with full rules, even when overlapping
        let h = header(0, Direction::Forward, 0);
        assert_eq!(None, h.merge_with(&a, false));
        assert_eq!(None, a.merge_with(&h, false));

        // Header rules merge with each other only on request
        let h2 = header(0, Direction::Forward, 5);
        assert_eq!(None, h.merge_with(&h2, false));
        let merged = h.merge_with(&h2, true).unwrap();
        assert_eq!(SeqRange::new(0, 10), merged.seq);

        // Different streams or directions never merge
        assert_eq!(None, a.merge_with(&full(1, Direction::Forward, 0, 10), false));
        assert_eq!(None, a.merge_with(&full(0, Direction::Reverse, 0, 10), false));
    }

    #[test]
    fn test_merge_rules_keeps_disjoint() {
        let rules = vec![
            full(0, Direction::Forward, 100, 10),
            full(0, Direction::Forward, 0, 10),
            full(0, Direction::Forward, 10, 10),
        ];
        let merged = merge_rules(&rules, false);
        assert_eq!(2, merged.len());
        assert_eq!(SeqRange::new(0, 25), merged[0].seq);
        assert_eq!(SeqRange::new(100, 115), merged[1].seq);
    }

    #[test]
    fn test_ruleset_queries() {
        let mut set = KeepRuleSet::new();
        set.add_rule(full(0, Direction::Forward, 0, 10));
        set.add_rule(full(0, Direction::Reverse, 50, 10));
        set.add_rule(header(1, Direction::Forward, 0));

        assert_eq!(1, set.rules_for(StreamId(0), Direction::Forward).count());
        assert_eq!(1, set.rules_for(StreamId(0), Direction::Reverse).count());
        assert_eq!(0, set.rules_for(StreamId(2), Direction::Forward).count());
        assert_eq!(15 + 15 + 5, set.total_preserved_bytes());
    }

    #[test]
    fn test_serialized_kind_tags() {
        let rule = header(0, Direction::Forward, 500);
        let text = ron::ser::to_string(&rule).unwrap();
        assert!(text.contains("tls_applicationdata_header"), "{}", text);
        assert!(text.contains("header_only"), "{}", text);

        let parsed: KeepRule = ron::de::from_str(&text).unwrap();
        assert_eq!(rule, parsed);
    }

    #[test]
    fn test_validate_flags_missing_flows() {
        let mut set = KeepRuleSet::new();
        set.add_rule(full(7, Direction::Forward, 0, 10));
        let problems = set.validate();
        assert_eq!(1, problems.len());
        assert!(problems[0].contains("no flow info for stream 7"));

        set.add_flow(FlowInfo {
            stream_id: StreamId(7),
            forward_source: Endpoint::v4(Ipv4Addr::new(10, 0, 0, 1), 1234),
            forward_destination: Endpoint::v4(Ipv4Addr::new(10, 0, 0, 2), 443),
            packet_count: 3,
            byte_count: 128,
        });
        assert!(set.validate().is_empty());
    }
}
