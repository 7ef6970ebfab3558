//! Preprocessing the keep-rule set into a per-flow-direction lookup

use fnv::FnvHashMap;
use keep_rules::{interval, Direction, KeepRuleSet, PreserveStrategy, SeqRange, StreamId};

/// Keep ranges of one flow direction, split by preserve strategy.
///
/// Full-preserve ranges are coalesced; header-only ranges keep their exact
/// 5-byte geometry so a sloppy full-preserve range can never widen them.
#[derive(Debug, Default, Clone)]
pub struct DirectionRules {
    pub header_only: Vec<SeqRange>,
    pub full_preserve: Vec<SeqRange>,
}

impl DirectionRules {
    pub fn is_empty(&self) -> bool {
        self.header_only.is_empty() && self.full_preserve.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RuleIndex {
    directions: FnvHashMap<(StreamId, Direction), DirectionRules>,
}

impl RuleIndex {
    pub fn build(ruleset: &KeepRuleSet) -> Self {
        let mut grouped: FnvHashMap<(StreamId, Direction), (Vec<SeqRange>, Vec<SeqRange>)> =
            FnvHashMap::default();
        for rule in ruleset.rules() {
            let entry = grouped
                .entry((rule.stream_id, rule.direction))
                .or_default();
            match rule.strategy {
                PreserveStrategy::HeaderOnly => entry.0.push(rule.seq),
                PreserveStrategy::FullPreserve => entry.1.push(rule.seq),
            }
        }

        let mut directions = FnvHashMap::default();
        for ((stream, direction), (mut header_only, full_preserve)) in grouped {
            header_only.sort();
            let full_preserve = interval::coalesce(full_preserve);
            log::debug!(
                "stream {} {}: {} header-only ranges, {} full-preserve ranges after merge",
                stream,
                direction,
                header_only.len(),
                full_preserve.len()
            );
            directions.insert(
                (stream, direction),
                DirectionRules {
                    header_only,
                    full_preserve,
                },
            );
        }
        Self { directions }
    }

    pub fn get(&self, stream: StreamId, direction: Direction) -> Option<&DirectionRules> {
        self.directions.get(&(stream, direction))
    }

    pub fn direction_count(&self) -> usize {
        self.directions.len()
    }
}
