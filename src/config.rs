use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

// ─── Boundary confidence weights ──────────────────────────────────────────────
//
// Additive heuristics with no derivation from traffic statistics. Exposed so
// they can be recalibrated against representative captures.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryWeights {
    pub base:                f32,
    pub crlf_crlf_bonus:     f32,
    pub lf_lf_bonus:         f32,
    pub crlf_lf_bonus:       f32,
    pub plausible_len_bonus: f32,
    pub oversize_penalty:    f32,
    pub header_token_bonus:  f32,
    pub fallback:            f32,
}

impl Default for BoundaryWeights {
    fn default() -> Self {
        Self {
            base:                0.5,
            crlf_crlf_bonus:     0.4,
            lf_lf_bonus:         0.3,
            crlf_lf_bonus:       0.2,
            plausible_len_bonus: 0.1,
            oversize_penalty:    0.2,
            header_token_bonus:  0.1,
            fallback:            0.6,
        }
    }
}

// ─── Scan configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Upper bound on bytes inspected for protocol features and the header boundary.
    pub max_scan_window:             usize,
    /// Byte budget for the body sample kept from a complete chunked body.
    pub chunked_sample_size:         usize,
    pub max_chunks_to_analyze:       usize,
    /// Fraction of unparsed chunked body bytes kept when the body is truncated.
    pub conservative_preserve_ratio: f64,
    pub min_preserve_bytes:          usize,
    pub max_preserve_bytes:          Option<usize>,
    /// Results below this confidence are treated as scan failures by `generate_mask`.
    pub confidence_threshold:        f32,
    /// Body bytes kept after the header of a Content-Length message.
    pub body_sample_size:            usize,
    pub boundary_weights:            BoundaryWeights,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_scan_window:             8192,
            chunked_sample_size:         1024,
            max_chunks_to_analyze:       10,
            conservative_preserve_ratio: 0.8,
            min_preserve_bytes:          64,
            max_preserve_bytes:          None,
            confidence_threshold:        0.5,
            body_sample_size:            64,
            boundary_weights:            BoundaryWeights::default(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_scan_window == 0 {
            return Err(ConfigError::ZeroScanWindow);
        }
        if !(0.0..=1.0).contains(&self.conservative_preserve_ratio) {
            return Err(ConfigError::PreserveRatio(self.conservative_preserve_ratio));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::ConfidenceThreshold(self.confidence_threshold));
        }
        if let Some(max) = self.max_preserve_bytes {
            if self.min_preserve_bytes > max {
                return Err(ConfigError::PreserveBounds { min: self.min_preserve_bytes, max });
            }
        }
        Ok(())
    }

    /// Load a JSON config; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {:?}", path))?;
        let cfg: ScanConfig = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {:?}", path))?;
        cfg.validate().with_context(|| format!("Rejected config {:?}", path))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test] fn defaults_validate() { assert!(ScanConfig::default().validate().is_ok()); }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ScanConfig = serde_json::from_str(r#"{"max_scan_window": 4096, "boundary_weights": {"fallback": 0.55}}"#).unwrap();
        assert_eq!(cfg.max_scan_window, 4096);
        assert_eq!(cfg.chunked_sample_size, 1024);
        assert_eq!(cfg.boundary_weights.fallback, 0.55);
        assert_eq!(cfg.boundary_weights.crlf_crlf_bonus, 0.4);
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = ScanConfig { conservative_preserve_ratio: 1.5, ..ScanConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::PreserveRatio(1.5)));

        let cfg = ScanConfig { max_scan_window: 0, ..ScanConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroScanWindow));

        let cfg = ScanConfig { min_preserve_bytes: 100, max_preserve_bytes: Some(10), ..ScanConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::PreserveBounds { min: 100, max: 10 }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"confidence_threshold": 0.7}"#).unwrap();
        let cfg = ScanConfig::load(&path).unwrap();
        assert_eq!(cfg.confidence_threshold, 0.7);

        fs::write(&path, r#"{"confidence_threshold": 7.0}"#).unwrap();
        assert!(ScanConfig::load(&path).is_err());
    }
}
