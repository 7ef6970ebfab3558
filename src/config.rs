//! Canonical stage configuration and the loose-value adapter
//!
//! The stage consumes exactly one configuration shape: `{protocol, mode,
//! marker_config, masker_config}`. [`MaskConfig::from_value`] is the edge
//! adapter for callers holding untyped JSON: it warns about unknown keys,
//! rejects invalid values with the full error list, and fills defaults for
//! everything absent.

use crate::error::StageError;
use payload_masker::MaskerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use tls_marker::MarkerConfig;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Marker + Masker, the regular pipeline
    Enhanced,
    /// Verbatim copy, bypassing both modules
    Basic,
    /// Enhanced plus rule-set and output validation
    Debug,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Enhanced
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Enhanced => f.write_str("enhanced"),
            Mode::Basic => f.write_str("basic"),
            Mode::Debug => f.write_str("debug"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "enhanced" => Ok(Mode::Enhanced),
            "basic" => Ok(Mode::Basic),
            "debug" => Ok(Mode::Debug),
            other => Err(format!(
                "unknown mode {:?}, expected enhanced, basic or debug",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub protocol: String,
    pub mode: Mode,
    pub marker_config: MarkerConfig,
    pub masker_config: MaskerConfig,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            protocol: "tls".to_string(),
            mode: Mode::default(),
            marker_config: MarkerConfig::default(),
            masker_config: MaskerConfig::default(),
        }
    }
}

/// Adapter output: the parsed configuration plus non-fatal findings
#[derive(Clone, Debug)]
pub struct NormalizedConfig {
    pub config: MaskConfig,
    pub warnings: Vec<String>,
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["protocol", "mode", "marker_config", "masker_config"];
const KNOWN_MARKER_KEYS: &[&str] = &["preserve", "tshark_path", "decode_as", "tshark_timeout_secs"];
const KNOWN_MASKER_KEYS: &[&str] = &[
    "chunk_size",
    "verify_checksums",
    "mask_byte_value",
    "max_buffer_bytes",
];

impl MaskConfig {
    /// Parse the canonical shape out of untyped JSON.
    ///
    /// Unknown keys become warnings; invalid values, unknown modes, unknown
    /// protocols and unknown TLS preserve types are configuration errors.
    pub fn from_value(value: &Value) -> Result<NormalizedConfig, StageError> {
        let object = match value {
            Value::Object(object) => object,
            _ => {
                return Err(StageError::Config(vec![
                    "configuration must be a JSON object".to_string(),
                ]))
            }
        };

        let mut warnings = Vec::new();
        let mut filtered = serde_json::Map::new();
        for (key, entry) in object {
            if KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                filtered.insert(key.clone(), entry.clone());
            } else {
                warnings.push(format!("ignoring unknown configuration key {:?}", key));
            }
        }
        warn_unknown_section_keys(&filtered, "marker_config", KNOWN_MARKER_KEYS, &mut warnings);
        warn_unknown_section_keys(&filtered, "masker_config", KNOWN_MASKER_KEYS, &mut warnings);

        // Modes are matched case-insensitively
        if let Some(Value::String(mode)) = filtered.get_mut("mode") {
            *mode = mode.to_ascii_lowercase();
        }

        let config: MaskConfig = serde_json::from_value(Value::Object(filtered))
            .map_err(|err| StageError::Config(vec![err.to_string()]))?;
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(StageError::Config(errors));
        }
        Ok(NormalizedConfig { config, warnings })
    }

    /// All problems with the configuration, empty when usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.protocol != "tls" {
            errors.push(format!(
                "unsupported protocol {:?}, only \"tls\" is implemented",
                self.protocol
            ));
        }
        errors.extend(self.marker_config.validate());
        errors.extend(self.masker_config.validate());
        errors
    }
}

fn warn_unknown_section_keys(
    object: &serde_json::Map<String, Value>,
    section: &str,
    known: &[&str],
    warnings: &mut Vec<String>,
) {
    if let Some(Value::Object(entries)) = object.get(section) {
        for key in entries.keys() {
            if !known.contains(&key.as_str()) {
                warnings.push(format!("ignoring unknown {} key {:?}", section, key));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let normalized = MaskConfig::from_value(&json!({})).unwrap();
        assert!(normalized.warnings.is_empty());
        let config = normalized.config;
        assert_eq!("tls", config.protocol);
        assert_eq!(Mode::Enhanced, config.mode);
        assert!(config.marker_config.preserve.handshake);
        assert!(!config.marker_config.preserve.application_data);
        assert_eq!(1000, config.masker_config.chunk_size);
        assert_eq!(0x00, config.masker_config.mask_byte_value);
        assert!(config.masker_config.verify_checksums);
    }

    #[test]
    fn test_unknown_keys_are_warnings() {
        let normalized = MaskConfig::from_value(&json!({
            "mode": "basic",
            "recipe": {"steps": []},
            "enable_dedup": true,
            "masker_config": {"chunk_size": 5, "keep_intermediate_files": true},
        }))
        .unwrap();
        assert_eq!(Mode::Basic, normalized.config.mode);
        assert_eq!(5, normalized.config.masker_config.chunk_size);
        assert_eq!(3, normalized.warnings.len());
    }

    #[test]
    fn test_mode_is_case_insensitive() {
        let normalized = MaskConfig::from_value(&json!({"mode": "DEBUG"})).unwrap();
        assert_eq!(Mode::Debug, normalized.config.mode);
        assert_eq!(Ok(Mode::Enhanced), "Enhanced".parse());
    }

    #[test]
    fn test_unknown_mode_is_an_error() {
        assert!(MaskConfig::from_value(&json!({"mode": "turbo"})).is_err());
    }

    #[test]
    fn test_unknown_protocol_is_an_error() {
        assert!(MaskConfig::from_value(&json!({"protocol": "http"})).is_err());
    }

    #[test]
    fn test_unknown_preserve_key_is_an_error() {
        let result = MaskConfig::from_value(&json!({
            "marker_config": {"preserve": {"handshakes": true}},
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_boolean_preserve_value_is_an_error() {
        let result = MaskConfig::from_value(&json!({
            "marker_config": {"preserve": {"handshake": "yes"}},
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_mask_byte_range_is_enforced() {
        let ok = MaskConfig::from_value(&json!({"masker_config": {"mask_byte_value": 255}}));
        assert_eq!(255, ok.unwrap().config.masker_config.mask_byte_value);
        let err = MaskConfig::from_value(&json!({"masker_config": {"mask_byte_value": 256}}));
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_decode_as_is_an_error() {
        let result = MaskConfig::from_value(&json!({
            "marker_config": {"decode_as": ["not-a-spec"]},
        }));
        match result {
            Err(StageError::Config(errors)) => {
                assert_eq!(1, errors.len());
                assert!(errors[0].contains("decode_as"));
            }
            other => panic!("expected a config error, got {:?}", other.map(|n| n.config)),
        }
    }
}
