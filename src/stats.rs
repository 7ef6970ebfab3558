//! The statistics record returned for every processed file

use crate::config::Mode;
use payload_masker::MaskingStats;
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct StageStats {
    pub stage_name: String,
    pub packets_processed: u64,
    pub packets_modified: u64,
    pub duration_ms: f64,
    pub extra_metrics: ExtraMetrics,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExtraMetrics {
    pub masked_bytes: u64,
    pub preserved_bytes: u64,
    pub masking_ratio: f64,
    pub preservation_ratio: f64,
    pub throughput_mbytes_per_sec: f64,
    pub protocol: String,
    pub mode: Mode,
    pub success: bool,
    pub cancelled: bool,
    /// Set when the stage fell back to a verbatim copy
    pub fallback_used: bool,
    /// Marker for non-masking operations, e.g. the basic-mode copy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StageStats {
    pub(crate) fn from_masking(
        stage_name: &str,
        protocol: &str,
        mode: Mode,
        masking: MaskingStats,
        mut warnings: Vec<String>,
    ) -> Self {
        warnings.extend(masking.warnings.iter().cloned());
        Self {
            stage_name: stage_name.to_string(),
            packets_processed: masking.processed_packets,
            packets_modified: masking.modified_packets,
            duration_ms: masking.duration.as_secs_f64() * 1000.0,
            extra_metrics: ExtraMetrics {
                masked_bytes: masking.masked_bytes,
                preserved_bytes: masking.preserved_bytes,
                masking_ratio: masking.masking_ratio(),
                preservation_ratio: masking.preservation_ratio(),
                throughput_mbytes_per_sec: masking.throughput_mbytes_per_sec(),
                protocol: protocol.to_string(),
                mode,
                success: masking.success,
                cancelled: masking.cancelled,
                fallback_used: false,
                operation: None,
                errors: masking.errors,
                warnings,
            },
        }
    }
}
