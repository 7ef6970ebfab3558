//! PktMask payload-masking stage
//!
//! Sanitizes packet captures by masking TCP payload bytes while keeping the
//! protocol framing intact: a TLS-aware Marker decides which byte ranges
//! must survive, and a protocol-agnostic Masker rewrites the capture so that
//! everything else becomes filler bytes of identical length. The output is
//! a valid capture with the same packet count, ordering, timestamps and
//! per-packet lengths as the input.
//!
//! ```no_run
//! use pktmask::{MaskConfig, MaskPayloadStage};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), pktmask::StageError> {
//! let stage = MaskPayloadStage::new(MaskConfig::default())?;
//! let stats = stage.process_file(Path::new("in.pcap"), Path::new("out.pcap"))?;
//! println!("masked {} bytes", stats.extra_metrics.masked_bytes);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod stage;
mod stats;

pub use crate::{
    config::{MaskConfig, Mode, NormalizedConfig},
    error::StageError,
    stage::{MaskPayloadStage, StopHandle, STAGE_NAME},
    stats::{ExtraMetrics, StageStats},
};

// The module configurations and the rule data model are part of the
// stage's public surface
pub use keep_rules::{Direction, KeepRule, KeepRuleSet, PreserveStrategy, RuleKind, StreamId};
pub use payload_masker::MaskerConfig;
pub use tls_marker::{MarkerConfig, PreserveConfig};
