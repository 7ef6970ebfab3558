//! Typed view of the dissector's JSON output
//!
//! `tshark -T json -e <field>...` prints an array of objects shaped like
//! `{"_source": {"layers": {"<field>": ["value", ...]}}}`. Every value is a
//! string, repeated fields collect into the array (`-E occurrence=a`). Only
//! the fields the analyzer consumes are modeled; the rest are ignored.

use anyhow::{Context as _, Result};
use itertools::Itertools;
use keep_rules::{Direction, Endpoint, FlowInfo, StreamId};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Deserialize, Debug)]
struct RawPacket {
    #[serde(rename = "_source")]
    source: RawSource,
}

#[derive(Deserialize, Debug)]
struct RawSource {
    #[serde(default)]
    layers: RawLayers,
}

#[derive(Deserialize, Debug, Default)]
struct RawLayers {
    #[serde(rename = "frame.number", default)]
    frame_number: Vec<String>,
    #[serde(rename = "ip.src", default)]
    ip_src: Vec<String>,
    #[serde(rename = "ip.dst", default)]
    ip_dst: Vec<String>,
    #[serde(rename = "ipv6.src", default)]
    ipv6_src: Vec<String>,
    #[serde(rename = "ipv6.dst", default)]
    ipv6_dst: Vec<String>,
    #[serde(rename = "tcp.srcport", default)]
    tcp_srcport: Vec<String>,
    #[serde(rename = "tcp.dstport", default)]
    tcp_dstport: Vec<String>,
    #[serde(rename = "tcp.stream", default)]
    tcp_stream: Vec<String>,
    #[serde(rename = "tcp.seq_raw", default)]
    tcp_seq_raw: Vec<String>,
    #[serde(rename = "tcp.len", default)]
    tcp_len: Vec<String>,
    #[serde(rename = "tls.record.content_type", default)]
    tls_content_type: Vec<String>,
    #[serde(rename = "tls.record.opaque_type", default)]
    tls_opaque_type: Vec<String>,
    #[serde(rename = "tls.record.length", default)]
    tls_record_length: Vec<String>,
    #[serde(rename = "tls.segment.data", default)]
    tls_segment_data: Vec<String>,
}

/// One TLS record as reported by the dissector: content type and body length
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct TlsRecordMeta {
    pub content_type: u8,
    pub length: u64,
}

/// One TCP frame of the capture, as far as the analyzer cares
#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Frame {
    pub number: u32,
    pub stream: StreamId,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq_raw: u64,
    pub tcp_len: u64,
    pub records: Vec<TlsRecordMeta>,
    pub has_segment_data: bool,
}

/// Parse one dissector pass. Frames without a TCP layer are dropped; frames
/// with unusable numeric fields are skipped with a warning.
pub(crate) fn parse_frames(json: &[u8]) -> Result<Vec<Frame>> {
    let packets: Vec<RawPacket> =
        serde_json::from_slice(json).context("dissector emitted unparseable JSON")?;

    Ok(packets
        .into_iter()
        .filter_map(|packet| frame_from_layers(packet.source.layers))
        .sorted_by_key(|frame| frame.number)
        .collect())
}

fn frame_from_layers(layers: RawLayers) -> Option<Frame> {
    // Non-TCP frames have no stream field; not an error
    let stream_field = layers.tcp_stream.first()?;
    let number_field = layers.frame_number.first()?;

    let number: u32 = match number_field.parse() {
        Ok(number) => number,
        Err(_) => {
            log::warn!("unparseable frame.number {:?}, skipping frame", number_field);
            return None;
        }
    };

    let stream: u64 = parse_or_warn(stream_field, "tcp.stream", number)?;
    let seq_raw: u64 = parse_or_warn(layers.tcp_seq_raw.first()?, "tcp.seq_raw", number)?;
    let tcp_len: u64 = layers
        .tcp_len
        .first()
        .and_then(|raw| parse_or_warn(raw, "tcp.len", number))
        .unwrap_or(0);

    let src_ip = layers.ip_src.first().or_else(|| layers.ipv6_src.first())?;
    let dst_ip = layers.ip_dst.first().or_else(|| layers.ipv6_dst.first())?;
    let src_port: u16 = parse_or_warn(layers.tcp_srcport.first()?, "tcp.srcport", number)?;
    let dst_port: u16 = parse_or_warn(layers.tcp_dstport.first()?, "tcp.dstport", number)?;
    let src = Endpoint::new(src_ip.parse().ok()?, src_port);
    let dst = Endpoint::new(dst_ip.parse().ok()?, dst_port);

    let records = parse_records(&layers, number);
    let has_segment_data = layers.tls_segment_data.iter().any(|data| !data.is_empty());

    Some(Frame {
        number,
        stream: StreamId(stream),
        src,
        dst,
        seq_raw,
        tcp_len,
        records,
        has_segment_data,
    })
}

/// Pair up content types and record lengths for one frame.
///
/// TLS 1.3 reports encrypted records under `tls.record.opaque_type`; those
/// values follow the plaintext content types in field order, so the two lists
/// concatenate. A frame whose type and length counts still disagree has no
/// usable record structure and contributes no rules.
fn parse_records(layers: &RawLayers, frame_number: u32) -> Vec<TlsRecordMeta> {
    let mut types: Vec<&String> = layers.tls_content_type.iter().collect();
    types.extend(layers.tls_opaque_type.iter());
    let lengths = &layers.tls_record_length;

    if types.is_empty() || types.len() != lengths.len() {
        if !types.is_empty() {
            log::warn!(
                "frame {}: {} TLS record types but {} lengths, ignoring records",
                frame_number,
                types.len(),
                lengths.len()
            );
        }
        return Vec::new();
    }

    types
        .iter()
        .zip(lengths)
        .filter_map(|(content_type, length)| {
            let content_type: u8 =
                parse_or_warn(content_type.as_str(), "tls.record.content_type", frame_number)?;
            let length: u64 = parse_or_warn(length.as_str(), "tls.record.length", frame_number)?;
            Some(TlsRecordMeta {
                content_type,
                length,
            })
        })
        .collect()
}

fn parse_or_warn<T: std::str::FromStr>(raw: &str, field: &str, frame: u32) -> Option<T> {
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("frame {}: unparseable {} {:?}", frame, field, raw);
            None
        }
    }
}

/// Merge the two dissector views, keyed by frame number.
///
/// The reassembled view wins where both saw a frame; segment-view frames are
/// added when they carry a record fragment (`tls.segment.data`), because the
/// reassembled view reports a cross-segment record only in the frame where
/// reassembly completed.
pub(crate) fn merge_views(reassembled: Vec<Frame>, segments: Vec<Frame>) -> BTreeMap<u32, Frame> {
    let mut merged = BTreeMap::new();
    for frame in reassembled {
        if !frame.records.is_empty() {
            merged.insert(frame.number, frame);
        }
    }
    for frame in segments {
        if frame.has_segment_data {
            merged.entry(frame.number).or_insert(frame);
        }
    }
    merged
}

/// Flow directory built from the segment view, which lists every frame of
/// the capture: the first frame of each stream defines the forward direction,
/// exactly as the rewriter's first-sighting rule does.
#[derive(Debug, Default)]
pub(crate) struct StreamDirectory {
    forward_source: HashMap<StreamId, Endpoint>,
    infos: HashMap<StreamId, FlowInfo>,
}

impl StreamDirectory {
    pub fn build(frames_in_order: &[Frame]) -> Self {
        let mut directory = Self::default();
        let mut last_seq: HashMap<(StreamId, Direction), u64> = HashMap::new();

        for frame in frames_in_order {
            let info = directory
                .infos
                .entry(frame.stream)
                .or_insert_with(|| FlowInfo {
                    stream_id: frame.stream,
                    forward_source: frame.src,
                    forward_destination: frame.dst,
                    packet_count: 0,
                    byte_count: 0,
                });
            info.packet_count += 1;
            info.byte_count += frame.tcp_len;
            let forward = info.forward_source;
            directory.forward_source.entry(frame.stream).or_insert(forward);

            // Raw 32-bit matching cannot follow a flow across a wrap
            let direction = directory.direction_of(frame);
            let last = last_seq.entry((frame.stream, direction)).or_insert(frame.seq_raw);
            if *last > frame.seq_raw && *last - frame.seq_raw > 0x7fff_ffff {
                log::warn!(
                    "stream {} {} wraps its sequence numbers within the capture; \
                     rules will not match past the wrap",
                    frame.stream,
                    direction
                );
            }
            *last = (*last).max(frame.seq_raw);
        }
        directory
    }

    pub fn direction_of(&self, frame: &Frame) -> Direction {
        match self.forward_source.get(&frame.stream) {
            Some(forward) if *forward == frame.src => Direction::Forward,
            Some(_) => Direction::Reverse,
            // Stream never seen in the segment view; treat as flow opener
            None => Direction::Forward,
        }
    }

    pub fn flow_info(&self, stream: StreamId) -> Option<&FlowInfo> {
        self.infos.get(&stream)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    /// Two frames the way tshark prints them: a pure ACK (no TLS fields) and
    /// a packet carrying two TLS records.
    const TSHARK_JSON: &str = r#"[
  {
    "_source": {
      "layers": {
        "frame.number": ["3"],
        "ip.src": ["10.0.0.1"],
        "ip.dst": ["10.0.0.2"],
        "tcp.srcport": ["40000"],
        "tcp.dstport": ["443"],
        "tcp.stream": ["0"],
        "tcp.seq_raw": ["1000"],
        "tcp.len": ["0"]
      }
    }
  },
  {
    "_source": {
      "layers": {
        "frame.number": ["4"],
        "ip.src": ["10.0.0.2"],
        "ip.dst": ["10.0.0.1"],
        "tcp.srcport": ["443"],
        "tcp.dstport": ["40000"],
        "tcp.stream": ["0"],
        "tcp.seq_raw": ["5000"],
        "tcp.len": ["100"],
        "tls.record.content_type": ["22"],
        "tls.record.opaque_type": ["23"],
        "tls.record.length": ["40", "50"]
      }
    }
  }
]"#;

    fn ep(last_octet: u8, port: u16) -> Endpoint {
        Endpoint::v4(Ipv4Addr::new(10, 0, 0, last_octet), port)
    }

    #[test]
    fn test_parse_frames() {
        let frames = parse_frames(TSHARK_JSON.as_bytes()).unwrap();
        assert_eq!(2, frames.len());

        assert_eq!(3, frames[0].number);
        assert_eq!(StreamId(0), frames[0].stream);
        assert_eq!(ep(1, 40000), frames[0].src);
        assert_eq!(0, frames[0].tcp_len);
        assert!(frames[0].records.is_empty());

        assert_eq!(4, frames[1].number);
        assert_eq!(5000, frames[1].seq_raw);
        assert_eq!(
            vec![
                TlsRecordMeta { content_type: 22, length: 40 },
                TlsRecordMeta { content_type: 23, length: 50 },
            ],
            frames[1].records
        );
    }

    #[test]
    fn test_mismatched_record_lists_are_dropped() {
        let json = r#"[{"_source": {"layers": {
            "frame.number": ["1"],
            "ip.src": ["10.0.0.1"], "ip.dst": ["10.0.0.2"],
            "tcp.srcport": ["1"], "tcp.dstport": ["2"],
            "tcp.stream": ["0"], "tcp.seq_raw": ["0"], "tcp.len": ["10"],
            "tls.record.content_type": ["22", "23"],
            "tls.record.length": ["40"]
        }}}]"#;
        let frames = parse_frames(json.as_bytes()).unwrap();
        assert_eq!(1, frames.len());
        assert!(frames[0].records.is_empty());
    }

    #[test]
    fn test_non_tcp_frames_are_dropped() {
        let json = r#"[{"_source": {"layers": {"frame.number": ["1"]}}}]"#;
        assert!(parse_frames(json.as_bytes()).unwrap().is_empty());
    }

    fn frame(number: u32, records: usize, segment_data: bool) -> Frame {
        Frame {
            number,
            stream: StreamId(0),
            src: ep(1, 40000),
            dst: ep(2, 443),
            seq_raw: u64::from(number) * 100,
            tcp_len: 100,
            records: vec![
                TlsRecordMeta {
                    content_type: 22,
                    length: 10
                };
                records
            ],
            has_segment_data: segment_data,
        }
    }

    #[test]
    fn test_merge_views_prefers_reassembled() {
        let reassembled = vec![frame(1, 1, false), frame(2, 0, false)];
        let segments = vec![frame(1, 0, true), frame(3, 0, true), frame(4, 0, false)];

        let merged = merge_views(reassembled, segments);
        // Frame 1 from the reassembled view (has records), frame 3 as a
        // fragment carrier; frame 2 (no records) and 4 (no fragment) dropped
        assert_eq!(vec![1, 3], merged.keys().copied().collect::<Vec<_>>());
        assert_eq!(1, merged[&1].records.len());
    }

    #[test]
    fn test_stream_directory_directions() {
        let mut opener = frame(1, 0, false);
        opener.src = ep(1, 40000);
        opener.dst = ep(2, 443);
        let mut reply = frame(2, 0, false);
        reply.src = ep(2, 443);
        reply.dst = ep(1, 40000);

        let directory = StreamDirectory::build(&[opener.clone(), reply.clone()]);
        assert_eq!(Direction::Forward, directory.direction_of(&opener));
        assert_eq!(Direction::Reverse, directory.direction_of(&reply));

        let info = directory.flow_info(StreamId(0)).unwrap();
        assert_eq!(ep(1, 40000), info.forward_source);
        assert_eq!(2, info.packet_count);
        assert_eq!(200, info.byte_count);
    }
}
