//! The Masker: rewrite every TCP payload of a capture under a keep-rule set
//!
//! Streams the input file block by block, computes for each TCP segment the
//! intersection of its absolute sequence range with the keep rules of its
//! flow direction, and zeroes every payload byte outside that intersection.
//! Packet lengths, ordering and timestamps never change; the TCP checksum of
//! a modified packet is recomputed. A packet matched by no rule is masked
//! completely, so an empty rule set turns every TCP payload into filler
//! bytes.
//!
//! Per-packet problems (malformed layer stacks, truncated captures) never
//! abort a file: the affected packet passes through unchanged and is counted
//! as a warning. Only unreadable input or unwritable output fail the run.

mod decode;
mod masking;
mod pcap_io;
mod rule_index;
mod stats;

pub use crate::{
    decode::{DecodeError, LinkKind, OuterChecksum, TcpGeometry, MAX_TUNNEL_DEPTH},
    stats::MaskingStats,
};

use crate::{
    decode::{apply_outer_checksum, locate_tcp},
    pcap_io::{BufferedWriter, CaptureKind},
    rule_index::RuleIndex,
};
use keep_rules::{FlowTable, KeepRuleSet, SeqRange};
use misc_utils::fs;
use pcap_parser::{
    pcapng::Block, traits::PcapReaderIterator, LegacyPcapReader, PcapBlockOwned, PcapError,
    PcapNGReader,
};
use serde::{Deserialize, Serialize};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot read {path}: {message}")]
    ReadFile { path: PathBuf, message: String },
    #[error("invalid capture: {0}")]
    InvalidCapture(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskerConfig {
    /// Packets per buffered flush to the output file
    pub chunk_size: usize,
    /// Recompute TCP checksums of modified packets
    pub verify_checksums: bool,
    /// Filler for masked payload bytes
    pub mask_byte_value: u8,
    /// Flush the output buffer early past this size
    pub max_buffer_bytes: usize,
}

impl Default for MaskerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            verify_checksums: true,
            mask_byte_value: 0x00,
            max_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

impl MaskerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.chunk_size == 0 {
            errors.push("chunk_size must be positive".to_string());
        }
        if self.max_buffer_bytes == 0 {
            errors.push("max_buffer_bytes must be positive".to_string());
        }
        errors
    }
}

/// Link type and data geometry of one packet block
#[derive(Copy, Clone, Debug)]
struct PacketGeometry {
    data_offset: usize,
    caplen: usize,
    link: LinkKind,
}

/// Per-file rewriting state; constructed fresh for every run so stream ids
/// come out deterministic
#[derive(Debug)]
struct RewriteState {
    flows: FlowTable,
    /// pcapng interfaces in declaration order, reset per section
    interfaces: Vec<LinkKind>,
    /// Link type from the legacy file header
    legacy_link: LinkKind,
}

impl RewriteState {
    fn new() -> Self {
        Self {
            flows: FlowTable::new(),
            interfaces: Vec::new(),
            legacy_link: LinkKind::Unsupported(-1),
        }
    }

    fn interface_link(&self, interface_id: usize) -> LinkKind {
        self.interfaces
            .get(interface_id)
            .copied()
            .unwrap_or(LinkKind::Unsupported(-1))
    }
}

/// The file ends in a partial block: after one fruitless refill, keep the
/// trailing bytes verbatim. Returns true once the tail has been copied.
fn copy_partial_tail(
    input: &[u8],
    offset_in_file: usize,
    stalled: &mut bool,
    writer: &mut BufferedWriter,
    stats: &mut MaskingStats,
) -> Result<bool, MaskError> {
    if !*stalled {
        *stalled = true;
        return Ok(false);
    }
    let rest = &input[offset_in_file.min(input.len())..];
    if !rest.is_empty() {
        stats.add_warning(format!(
            "{} trailing bytes do not form a whole block, copied verbatim",
            rest.len()
        ));
        writer.push(rest, false)?;
    }
    Ok(true)
}

fn refill_error<E: std::fmt::Debug>(err: E) -> MaskError {
    MaskError::InvalidCapture(format!("failed refilling capture reader: {:?}", err))
}

fn block_error<E: std::fmt::Debug>(offset_in_file: usize, err: E) -> MaskError {
    MaskError::InvalidCapture(format!(
        "malformed capture block at offset {}: {:?}",
        offset_in_file, err
    ))
}

pub struct PayloadMasker {
    config: MaskerConfig,
}

impl PayloadMasker {
    pub fn new(config: MaskerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MaskerConfig {
        &self.config
    }

    /// Rewrite `input_path` into `output_path` under the given rules.
    ///
    /// `cancel` is checked between packets; when it flips, buffers are
    /// flushed, the file is closed, and the returned stats carry
    /// `cancelled = true` and `success = false`.
    pub fn apply_masking(
        &self,
        input_path: &Path,
        output_path: &Path,
        ruleset: &KeepRuleSet,
        cancel: &AtomicBool,
    ) -> Result<MaskingStats, MaskError> {
        log::info!(
            "masking {} -> {}",
            input_path.display(),
            output_path.display()
        );
        let started = Instant::now();
        let mut stats = MaskingStats::default();

        // A degraded analysis (e.g. missing dissector) shows up here and
        // means every TCP payload will be masked
        for note in ruleset.annotations() {
            stats.add_warning(note.clone());
        }

        let input = fs::read(input_path).map_err(|err| MaskError::ReadFile {
            path: input_path.to_path_buf(),
            message: err.to_string(),
        })?;
        let kind = pcap_io::sniff_format(&input)?;

        let index = RuleIndex::build(ruleset);
        log::debug!(
            "rule index holds {} flow directions from {} rules",
            index.direction_count(),
            ruleset.rules().len()
        );

        let mut writer = BufferedWriter::create(
            output_path,
            self.config.chunk_size,
            self.config.max_buffer_bytes,
        )?;

        // The reader keeps whole blocks in its window; captures are bounded
        // by their own size
        let capacity = input.len().max(65_536);
        let cursor = Cursor::new(&input[..]);
        match kind {
            CaptureKind::Legacy => {
                let reader = LegacyPcapReader::new(capacity, cursor)
                    .map_err(|err| MaskError::InvalidCapture(format!("{:?}", err)))?;
                self.run_legacy(reader, &input, &index, &mut writer, &mut stats, cancel)?;
            }
            CaptureKind::Ng => {
                let reader = PcapNGReader::new(capacity, cursor)
                    .map_err(|err| MaskError::InvalidCapture(format!("{:?}", err)))?;
                self.run_ng(reader, &input, &index, &mut writer, &mut stats, cancel)?;
            }
        }

        writer.finish()?;
        stats.duration = started.elapsed();
        if stats.cancelled {
            stats.success = false;
        }
        log::info!(
            "masking done: {} packets, {} modified, {} bytes masked, {} preserved in {:.2?}",
            stats.processed_packets,
            stats.modified_packets,
            stats.masked_bytes,
            stats.preserved_bytes,
            stats.duration,
        );
        Ok(stats)
    }

    fn run_legacy(
        &self,
        mut reader: LegacyPcapReader<Cursor<&[u8]>>,
        input: &[u8],
        index: &RuleIndex,
        writer: &mut BufferedWriter,
        stats: &mut MaskingStats,
        cancel: &AtomicBool,
    ) -> Result<(), MaskError> {
        let mut state = RewriteState::new();
        let mut offset_in_file = 0usize;
        let mut stalled = false;

        loop {
            if cancel.load(Ordering::Relaxed) {
                stats.cancelled = true;
                stats.add_error("cancellation requested, output is incomplete".to_string());
                break;
            }
            match reader.next() {
                Ok((size, block)) => {
                    stalled = false;
                    self.handle_block(
                        input,
                        offset_in_file,
                        size,
                        &block,
                        &mut state,
                        index,
                        writer,
                        stats,
                    )?;
                    reader.consume(size);
                    offset_in_file += size;
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete) => {
                    if copy_partial_tail(input, offset_in_file, &mut stalled, writer, stats)? {
                        break;
                    }
                    reader.refill().map_err(refill_error)?;
                }
                Err(err) => return Err(block_error(offset_in_file, err)),
            }
        }
        Ok(())
    }

    fn run_ng(
        &self,
        mut reader: PcapNGReader<Cursor<&[u8]>>,
        input: &[u8],
        index: &RuleIndex,
        writer: &mut BufferedWriter,
        stats: &mut MaskingStats,
        cancel: &AtomicBool,
    ) -> Result<(), MaskError> {
        let mut state = RewriteState::new();
        let mut offset_in_file = 0usize;
        let mut stalled = false;

        loop {
            if cancel.load(Ordering::Relaxed) {
                stats.cancelled = true;
                stats.add_error("cancellation requested, output is incomplete".to_string());
                break;
            }
            match reader.next() {
                Ok((size, block)) => {
                    stalled = false;
                    self.handle_block(
                        input,
                        offset_in_file,
                        size,
                        &block,
                        &mut state,
                        index,
                        writer,
                        stats,
                    )?;
                    reader.consume(size);
                    offset_in_file += size;
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete) => {
                    if copy_partial_tail(input, offset_in_file, &mut stalled, writer, stats)? {
                        break;
                    }
                    reader.refill().map_err(refill_error)?;
                }
                Err(err) => return Err(block_error(offset_in_file, err)),
            }
        }
        Ok(())
    }

    /// Copy one block into the output, masking its packet data if it is a
    /// packet block
    #[allow(clippy::too_many_arguments)]
    fn handle_block(
        &self,
        input: &[u8],
        offset_in_file: usize,
        size: usize,
        block: &PcapBlockOwned<'_>,
        state: &mut RewriteState,
        index: &RuleIndex,
        writer: &mut BufferedWriter,
        stats: &mut MaskingStats,
    ) -> Result<(), MaskError> {
        let mut raw = match input.get(offset_in_file..offset_in_file + size) {
            Some(bytes) => bytes.to_vec(),
            None => {
                return Err(MaskError::InvalidCapture(format!(
                    "block at offset {} exceeds the file",
                    offset_in_file
                )))
            }
        };

        let packet = match block {
            PcapBlockOwned::LegacyHeader(header) => {
                state.legacy_link = LinkKind::from_linktype(header.network.0);
                None
            }
            PcapBlockOwned::Legacy(packet) => Some(PacketGeometry {
                data_offset: pcap_io::LEGACY_RECORD_HEADER_LEN,
                caplen: packet.caplen as usize,
                link: state.legacy_link,
            }),
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                // A new section starts a new interface list
                state.interfaces.clear();
                None
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                state.interfaces.push(LinkKind::from_linktype(idb.linktype.0));
                None
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => Some(PacketGeometry {
                data_offset: pcap_io::EPB_DATA_OFFSET,
                caplen: epb.caplen as usize,
                link: state.interface_link(epb.if_id as usize),
            }),
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => Some(PacketGeometry {
                data_offset: pcap_io::SPB_DATA_OFFSET,
                caplen: size
                    .saturating_sub(pcap_io::SPB_DATA_OFFSET + 4)
                    .min(spb.origlen as usize),
                link: state.interface_link(0),
            }),
            PcapBlockOwned::NG(_) => None,
        };

        if let Some(geometry) = packet {
            stats.processed_packets += 1;
            let packet_number = stats.processed_packets;
            self.process_packet(&mut raw, geometry, packet_number, &mut state.flows, index, stats);
        }
        writer.push(&raw, packet.is_some())
    }

    /// Mask one packet in place. Never fails: problems downgrade to
    /// warnings and leave the packet untouched.
    fn process_packet(
        &self,
        raw: &mut [u8],
        geometry: PacketGeometry,
        packet_number: u64,
        flows: &mut FlowTable,
        index: &RuleIndex,
        stats: &mut MaskingStats,
    ) {
        if geometry.data_offset > raw.len() {
            stats.add_warning(format!(
                "packet {}: block too short for its packet data",
                packet_number
            ));
            return;
        }
        let data_end = (geometry.data_offset + geometry.caplen).min(raw.len());
        let frame_range = geometry.data_offset..data_end;

        let tcp = match locate_tcp(&raw[frame_range], geometry.link) {
            Ok(Some(tcp)) => tcp,
            // Non-TCP traffic passes through byte-identical
            Ok(None) => return,
            Err(err) => {
                log::warn!("packet {}: {}", packet_number, err);
                stats.add_warning(format!("packet {}: {}", packet_number, err));
                return;
            }
        };
        // Every TCP segment must feed the flow table, SYN/ACK/FIN included:
        // the dissector numbers a conversation at its first packet, so
        // skipping empty segments here would let interleaved handshakes
        // shift the stream ids away from the analyzer's
        let (stream, direction) = flows.classify(tcp.source, tcp.destination);
        if tcp.payload_len == 0 {
            return;
        }

        let seq = u64::from(tcp.sequence_number);
        let segment = SeqRange::new(seq, seq + tcp.payload_len as u64);

        let payload_start = geometry.data_offset + tcp.payload_offset;
        let payload_end = payload_start + tcp.payload_len;
        let outcome = masking::apply_keep_rules(
            &raw[payload_start..payload_end],
            segment,
            index.get(stream, direction),
            self.config.mask_byte_value,
        );
        stats.preserved_bytes += outcome.preserved_bytes;
        stats.masked_bytes += outcome.masked_bytes;

        if outcome.payload[..] != raw[payload_start..payload_end] {
            raw[payload_start..payload_end].copy_from_slice(&outcome.payload);
            stats.modified_packets += 1;

            if self.config.verify_checksums {
                match tcp.compute_checksum(&outcome.payload) {
                    Ok(checksum) => {
                        let at = geometry.data_offset + tcp.checksum_offset();
                        raw[at..at + 2].copy_from_slice(&checksum.to_be_bytes());
                    }
                    Err(err) => {
                        stats.add_warning(format!("packet {}: {}", packet_number, err));
                    }
                }

                // Innermost to outermost, so every enclosing tunnel checksum
                // is computed over the final inner bytes
                for fixup in tcp.outer_checksums.iter().rev() {
                    let frame = &mut raw[geometry.data_offset..data_end];
                    if let Err(err) = apply_outer_checksum(frame, fixup) {
                        stats.add_warning(format!("packet {}: {}", packet_number, err));
                    }
                }
            }
        }
    }
}
