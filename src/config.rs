//! Engine configuration.
//!
//! All tunables recognized by the engine live here: clock-skew tolerance,
//! per-source staleness windows, the forecasting grid, scoring weights, and
//! the inference timeout. Values come from an optional JSON file plus a
//! small set of environment overrides; nothing is hard-coded elsewhere.

use crate::error::EngineError;
use crate::types::{SourceKind, metric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Maximum acceptable drift of `w_time + w_emission` from 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Records timestamped further than this ahead of ingestion time are
    /// rejected as malformed.
    pub max_clock_skew_s: i64,
    pub max_staleness_s: StalenessConfig,
    /// Records older than this behind a timeline's newest record are pruned.
    pub retention_window_s: i64,
    /// Width of one forecasting time bucket.
    pub bucket_width_s: i64,
    /// Number of history buckets (W) fed into the model.
    pub history_window: usize,
    /// Number of forecast horizons (K) emitted per prediction.
    pub horizon_buckets: usize,
    pub weights: ScoreWeights,
    pub inference_timeout_ms: u64,
    /// Declared per-metric defaults, used as the last gap-fill step before
    /// feature construction fails.
    pub fallback_defaults: BTreeMap<String, f64>,
    /// Entity queried for weather when a segment has no weather timeline of
    /// its own (e.g. one district-wide station).
    pub weather_fallback_entity: Option<String>,
    /// Entity queried for transit delay when a segment has no transit
    /// timeline of its own.
    pub transit_fallback_entity: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub traffic: i64,
    pub weather: i64,
    pub transit: i64,
}

impl StalenessConfig {
    pub fn for_kind(&self, kind: SourceKind) -> i64 {
        match kind {
            SourceKind::Traffic => self.traffic,
            SourceKind::Weather => self.weather,
            SourceKind::Transit => self.transit,
        }
    }
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            traffic: 600,
            weather: 7200,
            transit: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub w_time: f64,
    pub w_emission: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            w_time: 0.7,
            w_emission: 0.3,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut fallback_defaults = BTreeMap::new();
        // Absent transit reporting means no known delay, not missing data.
        fallback_defaults.insert(metric::DELAY_S.to_string(), 0.0);

        Self {
            max_clock_skew_s: 120,
            max_staleness_s: StalenessConfig::default(),
            retention_window_s: 7 * 24 * 3600,
            bucket_width_s: 300,
            history_window: 6,
            horizon_buckets: 4,
            weights: ScoreWeights::default(),
            inference_timeout_ms: 2_000,
            fallback_defaults,
            weather_fallback_entity: None,
            transit_fallback_entity: None,
        }
    }
}

impl EngineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let cfg: EngineConfig = serde_json::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads from `path` when given, otherwise starts from defaults; then
    /// applies environment overrides and validates.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut cfg = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                serde_json::from_str(&content)?
            }
            None => EngineConfig::default(),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment overrides for the knobs operators most often tune.
    ///
    /// Recognized: `MOBILITY_W_TIME`, `MOBILITY_W_EMISSION`,
    /// `MOBILITY_INFERENCE_TIMEOUT_MS`, `MOBILITY_MAX_CLOCK_SKEW_S`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("MOBILITY_W_TIME") {
            self.weights.w_time = v;
        }
        if let Some(v) = env_f64("MOBILITY_W_EMISSION") {
            self.weights.w_emission = v;
        }
        if let Some(v) = env_u64("MOBILITY_INFERENCE_TIMEOUT_MS") {
            self.inference_timeout_ms = v;
        }
        if let Some(v) = env_i64("MOBILITY_MAX_CLOCK_SKEW_S") {
            self.max_clock_skew_s = v;
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.bucket_width_s <= 0 {
            return Err(EngineError::Config(format!(
                "bucket_width_s must be positive, got {}",
                self.bucket_width_s
            )));
        }
        if self.history_window == 0 || self.horizon_buckets == 0 {
            return Err(EngineError::Config(
                "history_window and horizon_buckets must be at least 1".to_string(),
            ));
        }
        if self.retention_window_s < self.bucket_width_s {
            return Err(EngineError::Config(format!(
                "retention_window_s ({}) must cover at least one bucket ({})",
                self.retention_window_s, self.bucket_width_s
            )));
        }
        for kind in SourceKind::ALL {
            let staleness = self.max_staleness_s.for_kind(kind);
            if staleness <= 0 {
                return Err(EngineError::Config(format!(
                    "max_staleness_s.{kind} must be positive, got {staleness}"
                )));
            }
        }
        let ScoreWeights { w_time, w_emission } = self.weights;
        if !(0.0..=1.0).contains(&w_time) || !(0.0..=1.0).contains(&w_emission) {
            return Err(EngineError::Config(format!(
                "scoring weights must lie in [0, 1], got w_time={w_time} w_emission={w_emission}"
            )));
        }
        if (w_time + w_emission - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::Config(format!(
                "scoring weights must sum to 1.0, got {}",
                w_time + w_emission
            )));
        }
        if let Some(ff) = self.fallback_defaults.get(metric::FREE_FLOW_KMH)
            && *ff <= 0.0
        {
            return Err(EngineError::Config(format!(
                "fallback default for {} must be positive, got {ff}",
                metric::FREE_FLOW_KMH
            )));
        }
        Ok(())
    }
}

fn env_f64(name: &str) -> Option<f64> {
    env_parsed(name, |s| s.parse::<f64>().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_parsed(name, |s| s.parse::<u64>().ok())
}

fn env_i64(name: &str) -> Option<i64> {
    env_parsed(name, |s| s.parse::<i64>().ok())
}

fn env_parsed<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        debug!(var = name, value = %raw, "Ignoring unparseable env override");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut cfg = EngineConfig::default();
        cfg.weights = ScoreWeights {
            w_time: 0.8,
            w_emission: 0.3,
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_staleness_must_be_positive() {
        let mut cfg = EngineConfig::default();
        cfg.max_staleness_s.weather = 0;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_zero_free_flow_default_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.fallback_defaults
            .insert(metric::FREE_FLOW_KMH.to_string(), 0.0);
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_load_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"bucket_width_s": 60, "horizon_buckets": 8}"#).unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.bucket_width_s, 60);
        assert_eq!(cfg.horizon_buckets, 8);
        // untouched fields keep their defaults
        assert_eq!(cfg.history_window, 6);
        assert_eq!(cfg.max_staleness_s.traffic, 600);
    }
}
