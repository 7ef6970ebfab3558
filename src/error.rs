//! Stage-level error taxonomy
//!
//! Only errors that terminate a run or a file surface here. Per-packet
//! problems are absorbed into the statistics record's warning list, and
//! dissector failures degrade to mask-everything instead of failing the
//! stage.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    /// Unusable configuration; detected before any file is touched
    #[error("configuration error: {}", .0.join("; "))]
    Config(Vec<String>),

    /// Cannot open, read or write a file; fatal for the current file
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The rewriter gave up on the file; the output is invalid
    #[error("masking failed: {0}")]
    Mask(#[from] payload_masker::MaskError),

    /// Marker construction failed (configuration-level problem)
    #[error("marker setup failed: {0}")]
    Marker(#[from] tls_marker::MarkerError),
}
