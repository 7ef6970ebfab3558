//! Capture container plumbing: format sniffing and ordered, buffered output
//!
//! The rewriter never re-serializes captures. Each block of the input is
//! copied verbatim and only the packet-data region (and the TCP checksum in
//! it) is patched, so the output keeps the input's format, endianness,
//! timestamp resolution and block layout byte for byte.

use crate::MaskError;
use std::{fs::File, io::Write, path::Path};

/// Offset of packet data inside a legacy pcap record (16-byte record header)
pub(crate) const LEGACY_RECORD_HEADER_LEN: usize = 16;
/// Offset of packet data inside a pcapng Enhanced Packet Block
pub(crate) const EPB_DATA_OFFSET: usize = 28;
/// Offset of packet data inside a pcapng Simple Packet Block
pub(crate) const SPB_DATA_OFFSET: usize = 12;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum CaptureKind {
    Legacy,
    Ng,
}

/// Check the file magic and pick the container format.
///
/// Covers both legacy byte orders, the nanosecond-resolution variants, and
/// the pcapng section header magic.
pub(crate) fn sniff_format(input: &[u8]) -> Result<CaptureKind, MaskError> {
    let magic = match input.get(0..4) {
        Some(magic) => [magic[0], magic[1], magic[2], magic[3]],
        None => {
            return Err(MaskError::InvalidCapture(
                "file is shorter than a capture magic".to_string(),
            ))
        }
    };
    match u32::from_be_bytes(magic) {
        0xa1b2_c3d4 | 0xd4c3_b2a1 | 0xa1b2_3c4d | 0x4d3c_b2a1 => Ok(CaptureKind::Legacy),
        0x0a0d_0d0a => Ok(CaptureKind::Ng),
        other => Err(MaskError::InvalidCapture(format!(
            "unrecognized capture magic {:#010x}",
            other
        ))),
    }
}

/// Output buffer honoring input order: blocks are appended as processed and
/// flushed every `chunk_size` packets, when the buffer outgrows its memory
/// budget, and at the end of the run.
pub(crate) struct BufferedWriter {
    file: File,
    buffer: Vec<u8>,
    buffered_packets: usize,
    chunk_size: usize,
    max_buffer_bytes: usize,
}

impl BufferedWriter {
    pub fn create(
        path: &Path,
        chunk_size: usize,
        max_buffer_bytes: usize,
    ) -> Result<Self, MaskError> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            buffer: Vec::new(),
            buffered_packets: 0,
            chunk_size: chunk_size.max(1),
            max_buffer_bytes: max_buffer_bytes.max(1),
        })
    }

    pub fn push(&mut self, block: &[u8], is_packet: bool) -> Result<(), MaskError> {
        self.buffer.extend_from_slice(block);
        if is_packet {
            self.buffered_packets += 1;
        }

        if self.buffered_packets >= self.chunk_size {
            self.flush_buffer()?;
        } else if self.buffer.len() >= self.max_buffer_bytes {
            log::info!(
                "output buffer reached {} bytes, flushing early to relieve memory pressure",
                self.buffer.len()
            );
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), MaskError> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        self.buffered_packets = 0;
        Ok(())
    }

    /// Flush everything and hand the file back to the OS
    pub fn finish(mut self) -> Result<(), MaskError> {
        self.flush_buffer()?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sniff_formats() {
        assert_eq!(
            CaptureKind::Legacy,
            sniff_format(&[0xa1, 0xb2, 0xc3, 0xd4, 0, 0]).unwrap()
        );
        assert_eq!(
            CaptureKind::Legacy,
            sniff_format(&[0xd4, 0xc3, 0xb2, 0xa1]).unwrap()
        );
        // Nanosecond-resolution legacy magic
        assert_eq!(
            CaptureKind::Legacy,
            sniff_format(&[0xa1, 0xb2, 0x3c, 0x4d]).unwrap()
        );
        assert_eq!(
            CaptureKind::Ng,
            sniff_format(&[0x0a, 0x0d, 0x0d, 0x0a]).unwrap()
        );

        assert!(sniff_format(&[]).is_err());
        assert!(sniff_format(&[1, 2]).is_err());
        assert!(sniff_format(b"GIF89a").is_err());
    }
}
