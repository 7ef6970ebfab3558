//! The payload-masking pipeline stage
//!
//! Wires the two modules together: the Marker analyzes the capture and
//! produces the keep-rule set, the Masker rewrites the capture under it.
//! Per-file state lives inside the module calls; the stage itself only
//! holds configuration and the cooperative stop flag, so one instance can
//! process many files in sequence with deterministic results.

use crate::{
    config::{MaskConfig, Mode, NormalizedConfig},
    error::StageError,
    stats::{ExtraMetrics, StageStats},
};
use payload_masker::PayloadMasker;
use serde_json::Value;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tls_marker::TlsMarker;

pub const STAGE_NAME: &str = "mask_payloads";

/// Cloneable cooperative stop signal, checked between packets
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

pub struct MaskPayloadStage {
    config: MaskConfig,
    /// Findings from configuration normalization, surfaced on every stats
    /// record this stage produces
    config_warnings: Vec<String>,
    stop: StopHandle,
}

impl MaskPayloadStage {
    pub fn new(config: MaskConfig) -> Result<Self, StageError> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(StageError::Config(errors));
        }
        log::info!(
            "stage configured: protocol={}, mode={}",
            config.protocol,
            config.mode
        );
        Ok(Self {
            config,
            config_warnings: Vec::new(),
            stop: StopHandle::new(),
        })
    }

    /// Build the stage from untyped JSON via the canonical-shape adapter
    pub fn from_value(value: &Value) -> Result<Self, StageError> {
        let NormalizedConfig { config, warnings } = MaskConfig::from_value(value)?;
        for warning in &warnings {
            log::warn!("{}", warning);
        }
        let mut stage = Self::new(config)?;
        stage.config_warnings = warnings;
        Ok(stage)
    }

    pub fn config(&self) -> &MaskConfig {
        &self.config
    }

    /// Signal to abort processing between packets
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Process one capture file into a masked copy
    pub fn process_file(&self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        let started = Instant::now();
        match self.config.mode {
            Mode::Basic => self.passthrough_copy(input, output, started, None),
            Mode::Enhanced | Mode::Debug => self.mask_file(input, output, started),
        }
    }

    fn mask_file(
        &self,
        input: &Path,
        output: &Path,
        started: Instant,
    ) -> Result<StageStats, StageError> {
        // Fresh modules per file: no state crosses file boundaries
        let marker = TlsMarker::new(self.config.marker_config.clone())?;
        let masker = PayloadMasker::new(self.config.masker_config.clone());

        let ruleset = marker.analyze_file(input);
        let mut warnings = self.config_warnings.clone();
        if self.config.mode == Mode::Debug {
            for problem in ruleset.validate() {
                warnings.push(format!("rule validation: {}", problem));
            }
        }

        match masker.apply_masking(input, output, &ruleset, self.stop.flag()) {
            Ok(masking) => {
                if self.config.mode == Mode::Debug && !masking.cancelled {
                    // Rewriting preserves every block length, so the files
                    // must match in size
                    let input_len = std::fs::metadata(input)?.len();
                    let output_len = std::fs::metadata(output)?.len();
                    if input_len != output_len {
                        warnings.push(format!(
                            "output size {} differs from input size {}",
                            output_len, input_len
                        ));
                    }
                }
                Ok(StageStats::from_masking(
                    STAGE_NAME,
                    &self.config.protocol,
                    self.config.mode,
                    masking,
                    warnings,
                ))
            }
            Err(err) => {
                // Last resort: ship an unmasked copy rather than nothing,
                // and say so loudly
                log::error!(
                    "masking {} failed ({}), falling back to a verbatim copy",
                    input.display(),
                    err
                );
                let mut stats =
                    self.passthrough_copy(input, output, started, Some(err.to_string()))?;
                stats.extra_metrics.fallback_used = true;
                Ok(stats)
            }
        }
    }

    fn passthrough_copy(
        &self,
        input: &Path,
        output: &Path,
        started: Instant,
        failure: Option<String>,
    ) -> Result<StageStats, StageError> {
        let copied = std::fs::copy(input, output)?;
        log::info!(
            "copied {} verbatim to {} ({} bytes)",
            input.display(),
            output.display(),
            copied
        );

        let mut errors = Vec::new();
        if let Some(failure) = failure {
            errors.push(format!("masking failed, output is unmasked: {}", failure));
        }
        let success = errors.is_empty();
        Ok(StageStats {
            stage_name: STAGE_NAME.to_string(),
            packets_processed: 0,
            packets_modified: 0,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            extra_metrics: ExtraMetrics {
                masked_bytes: 0,
                preserved_bytes: 0,
                masking_ratio: 0.0,
                preservation_ratio: 0.0,
                throughput_mbytes_per_sec: 0.0,
                protocol: self.config.protocol.clone(),
                mode: self.config.mode,
                success,
                cancelled: false,
                fallback_used: false,
                operation: Some("passthrough_copy".to_string()),
                errors,
                warnings: self.config_warnings.clone(),
            },
        })
    }
}
