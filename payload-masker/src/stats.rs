//! Statistics of one masking run

use serde::Serialize;
use std::time::Duration;

/// Counters and outcome of rewriting a single capture file
#[derive(Clone, Debug, Serialize)]
pub struct MaskingStats {
    pub success: bool,
    /// True when a cooperative stop ended the run early; the partial output
    /// is ordered but must be treated as invalid
    pub cancelled: bool,
    pub processed_packets: u64,
    pub modified_packets: u64,
    pub masked_bytes: u64,
    pub preserved_bytes: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for MaskingStats {
    fn default() -> Self {
        Self {
            success: true,
            cancelled: false,
            processed_packets: 0,
            modified_packets: 0,
            masked_bytes: 0,
            preserved_bytes: 0,
            duration: Duration::from_secs(0),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl MaskingStats {
    pub fn total_payload_bytes(&self) -> u64 {
        self.masked_bytes + self.preserved_bytes
    }

    pub fn masking_ratio(&self) -> f64 {
        ratio(self.masked_bytes, self.total_payload_bytes())
    }

    pub fn preservation_ratio(&self) -> f64 {
        ratio(self.preserved_bytes, self.total_payload_bytes())
    }

    pub fn modification_ratio(&self) -> f64 {
        ratio(self.modified_packets, self.processed_packets)
    }

    pub fn throughput_mbytes_per_sec(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.total_payload_bytes() as f64 / (1024.0 * 1024.0)) / secs
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.success = false;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
