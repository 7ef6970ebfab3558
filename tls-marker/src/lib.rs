//! TLS protocol analyzer producing keep rules for the payload rewriter
//!
//! The marker never inspects packet bytes itself. It drives an external
//! TLS-aware dissector (tshark) over the capture in two passes, merges the
//! per-frame views, and emits one [`KeepRule`] per TLS record it observed:
//! the whole record for preserved content types, or only the 5-byte record
//! header for ApplicationData when its body is configured to be masked.
//!
//! Analysis is best-effort by contract: a missing, outdated, or failing
//! dissector yields an *empty, annotated* rule set, which downstream turns
//! into "mask every TCP payload". Only configuration errors are hard errors.

mod frames;
mod tshark;

pub use crate::tshark::{Pass, Tshark, MIN_TSHARK_VERSION};

use crate::frames::{Frame, StreamDirectory, TlsRecordMeta};
use keep_rules::{
    Direction, FlowInfo, KeepRule, KeepRuleSet, StreamId, TLS_RECORD_HEADER_LEN,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("invalid marker configuration: {}", .0.join("; "))]
    Config(Vec<String>),
    #[error("dissector failure: {0}")]
    Dissector(String),
    #[error("dissector timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Which TLS content types keep their full record body.
///
/// `application_data = false` does not drop ApplicationData records: they
/// still get a header-only rule so the record framing stays readable while
/// the encrypted body is masked. For every other type, `false` means no rule
/// at all.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PreserveConfig {
    pub handshake: bool,
    pub application_data: bool,
    pub alert: bool,
    pub change_cipher_spec: bool,
    pub heartbeat: bool,
}

impl Default for PreserveConfig {
    fn default() -> Self {
        Self {
            handshake: true,
            application_data: false,
            alert: true,
            change_cipher_spec: true,
            heartbeat: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub preserve: PreserveConfig,
    /// Explicit dissector path; `tshark` from `PATH` when unset
    pub tshark_path: Option<PathBuf>,
    /// Extra `port,protocol` hints forwarded to the dissector as `-d`
    pub decode_as: Vec<String>,
    /// Wall-clock limit per dissector invocation
    pub tshark_timeout_secs: u64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            preserve: PreserveConfig::default(),
            tshark_path: None,
            decode_as: Vec::new(),
            tshark_timeout_secs: 300,
        }
    }
}

impl MarkerConfig {
    /// All problems with the configuration, empty when usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for spec in &self.decode_as {
            let valid = match spec.split_once(',') {
                Some((port, proto)) => port.parse::<u16>().is_ok() && !proto.is_empty(),
                None => false,
            };
            if !valid {
                errors.push(format!(
                    "decode_as entry {:?} is not of the form `port,protocol`",
                    spec
                ));
            }
        }
        if self.tshark_timeout_secs == 0 {
            errors.push("tshark_timeout_secs must be positive".to_string());
        }
        errors
    }
}

/// The Marker: analyze a capture, return the byte ranges to preserve
#[derive(Clone, Debug)]
pub struct TlsMarker {
    config: MarkerConfig,
}

impl TlsMarker {
    pub fn new(config: MarkerConfig) -> Result<Self, MarkerError> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(MarkerError::Config(errors));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &MarkerConfig {
        &self.config
    }

    /// Analyze one capture file.
    ///
    /// Never fails: dissector problems degrade to an empty rule set whose
    /// annotation explains what went wrong.
    pub fn analyze_file(&self, pcap_path: &Path) -> KeepRuleSet {
        let started = Instant::now();
        match self.try_analyze(pcap_path) {
            Ok(ruleset) => {
                log::info!(
                    "TLS analysis of {} finished in {:.2?}: {} rules over {} streams",
                    pcap_path.display(),
                    started.elapsed(),
                    ruleset.rules().len(),
                    ruleset.stream_count(),
                );
                ruleset
            }
            Err(err) => {
                log::warn!(
                    "TLS analysis of {} failed, all TCP payloads will be masked: {}",
                    pcap_path.display(),
                    err
                );
                KeepRuleSet::degraded(err.to_string())
            }
        }
    }

    fn try_analyze(&self, pcap_path: &Path) -> Result<KeepRuleSet, MarkerError> {
        let tshark = Tshark::locate(&self.config)?;

        let reassembled_json = tshark.run_pass(pcap_path, Pass::Reassembled, &self.config.decode_as)?;
        let segments_json = tshark.run_pass(pcap_path, Pass::Segments, &self.config.decode_as)?;

        let reassembled = frames::parse_frames(&reassembled_json)
            .map_err(|err| MarkerError::Dissector(format!("{:#}", err)))?;
        let segments = frames::parse_frames(&segments_json)
            .map_err(|err| MarkerError::Dissector(format!("{:#}", err)))?;

        let directory = StreamDirectory::build(&segments);
        let merged = frames::merge_views(reassembled, segments);
        Ok(generate_rules(&merged, &directory, &self.config.preserve))
    }
}

/// Emit rules for every TLS record of every merged frame, in frame order
fn generate_rules(
    merged: &BTreeMap<u32, Frame>,
    directory: &StreamDirectory,
    preserve: &PreserveConfig,
) -> KeepRuleSet {
    let mut ruleset = KeepRuleSet::new();

    for frame in merged.values() {
        if frame.records.is_empty() {
            continue;
        }
        let direction = directory.direction_of(frame);

        // Running byte offset of the record inside this frame's payload
        let mut offset = 0u64;
        for (idx, record) in frame.records.iter().enumerate() {
            let total = TLS_RECORD_HEADER_LEN + record.length;

            // A record longer than the carrying frame completed reassembly
            // here but started in an earlier segment
            let record_start = if idx == 0 && total > frame.tcp_len {
                cross_segment_start(merged, frame)
            } else {
                frame.seq_raw + offset
            };

            if let Some(rule) = rule_for_record(frame, direction, record, record_start, preserve) {
                log::debug!(
                    "frame {}: {} rule [{}, {})",
                    frame.number,
                    rule.kind,
                    rule.seq.start,
                    rule.seq.end
                );
                ruleset.add_rule(rule);
            }
            offset += total;
        }
    }

    let streams: HashSet<StreamId> = ruleset.rules().iter().map(|rule| rule.stream_id).collect();
    for frame in merged.values() {
        if !streams.contains(&frame.stream) || ruleset.flows().contains_key(&frame.stream) {
            continue;
        }
        match directory.flow_info(frame.stream) {
            Some(info) => ruleset.add_flow(*info),
            // Stream absent from the segment view; record what we saw
            None => ruleset.add_flow(FlowInfo {
                stream_id: frame.stream,
                forward_source: frame.src,
                forward_destination: frame.dst,
                packet_count: 0,
                byte_count: 0,
            }),
        }
    }

    ruleset
}

fn rule_for_record(
    frame: &Frame,
    direction: Direction,
    record: &TlsRecordMeta,
    record_start: u64,
    preserve: &PreserveConfig,
) -> Option<KeepRule> {
    let keep_body = match record.content_type {
        20 => preserve.change_cipher_spec,
        21 => preserve.alert,
        22 => preserve.handshake,
        23 => preserve.application_data,
        24 => preserve.heartbeat,
        other => {
            log::warn!(
                "frame {}: skipping record with unknown TLS content type {}",
                frame.number,
                other
            );
            return None;
        }
    };

    let built = if record.content_type == 23 && !keep_body {
        KeepRule::application_data_header(frame.stream, direction, record_start, frame.number)
    } else if keep_body {
        KeepRule::full_record(
            frame.stream,
            direction,
            record_start,
            record.length,
            record.content_type,
            frame.number,
        )
    } else {
        return None;
    };

    match built {
        Ok(rule) => Some(rule),
        Err(err) => {
            log::warn!("frame {}: dropping unbuildable rule: {}", frame.number, err);
            None
        }
    }
}

/// Walk backwards to the first segment of a cross-segment record.
///
/// A predecessor qualifies when it belongs to the same stream and direction,
/// ends exactly where the chain currently starts, and carries a record
/// fragment in the segment view. The earliest chain member's sequence number
/// is the record start.
fn cross_segment_start(merged: &BTreeMap<u32, Frame>, current: &Frame) -> u64 {
    let mut start = current.seq_raw;
    let mut number = current.number;

    'walk: loop {
        for (&pred_number, pred) in merged.range(..number).rev() {
            if pred.stream == current.stream
                && pred.src == current.src
                && pred.has_segment_data
                && pred.seq_raw + pred.tcp_len == start
            {
                start = pred.seq_raw;
                number = pred_number;
                continue 'walk;
            }
        }
        break;
    }

    if start == current.seq_raw {
        log::warn!(
            "frame {}: record exceeds its frame but no contiguous predecessor was found, \
             keeping the reporting frame's sequence start",
            current.number
        );
    }
    start
}
