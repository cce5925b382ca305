//! Congestion forecasting.
//!
//! The [`Forecaster`] serves a trained model artifact when one is loaded and
//! otherwise degrades to the historical-average baseline. The artifact
//! handle is explicitly scoped and swappable at runtime; nothing here is a
//! process-wide singleton.

pub mod baseline;
pub mod model;

use crate::error::EngineError;
use crate::features::{FEATURE_SCHEMA_VERSION, FeatureVector};
use crate::profile::ProfileStore;
use chrono::{DateTime, Utc};
use model::ModelArtifact;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Discretized congestion bands over the congestion index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Free,
    Moderate,
    Heavy,
    Jam,
}

impl CongestionLevel {
    /// Thresholds 0.25 / 0.50 / 0.75, lower-inclusive.
    pub fn from_index(index: f64) -> Self {
        if index < 0.25 {
            CongestionLevel::Free
        } else if index < 0.50 {
            CongestionLevel::Moderate
        } else if index < 0.75 {
            CongestionLevel::Heavy
        } else {
            CongestionLevel::Jam
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::Free => "free",
            CongestionLevel::Moderate => "moderate",
            CongestionLevel::Heavy => "heavy",
            CongestionLevel::Jam => "jam",
        }
    }
}

impl fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 95% interval on the congestion index, clamped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonPrediction {
    /// 1-based offset in buckets from the forecast anchor.
    pub horizon_bucket: usize,
    pub congestion_index: f64,
    pub level: CongestionLevel,
    pub interval: ConfidenceInterval,
}

/// One issued forecast. Immutable; a newer forecast supersedes it, nothing
/// mutates it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub segment_id: String,
    pub issued_at: DateTime<Utc>,
    pub schema_version: u32,
    /// 0 marks the historical baseline; trained artifacts start at 1.
    pub model_version: u32,
    pub degraded: bool,
    pub horizons: Vec<HorizonPrediction>,
}

pub struct Forecaster {
    model: RwLock<Option<Arc<ModelArtifact>>>,
    horizon_buckets: usize,
    bucket_width_s: i64,
}

impl Forecaster {
    pub fn new(horizon_buckets: usize, bucket_width_s: i64) -> Self {
        Self {
            model: RwLock::new(None),
            horizon_buckets,
            bucket_width_s,
        }
    }

    /// Swaps in a model artifact; in-flight predictions keep the handle they
    /// already cloned.
    pub fn install_model(&self, artifact: ModelArtifact) {
        let mut slot = self.model.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(artifact));
    }

    pub fn current_model(&self) -> Option<Arc<ModelArtifact>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Strict model prediction over the history window. Fails when no
    /// artifact is loaded, when the artifact's feature schema differs from
    /// the builder's, or when the window is empty; see [`Self::forecast`]
    /// for the degrading wrapper.
    pub fn predict(
        &self,
        segment_id: &str,
        window: &[FeatureVector],
    ) -> Result<ForecastResult, EngineError> {
        let model = self.current_model().ok_or_else(|| {
            EngineError::ModelUnavailable("no model artifact loaded".to_string())
        })?;
        if model.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(EngineError::SchemaVersionMismatch {
                expected: FEATURE_SCHEMA_VERSION,
                found: model.schema_version,
            });
        }
        let input = model::model_input(window).ok_or_else(|| EngineError::InsufficientData {
            scope: segment_id.to_string(),
            missing: "feature history window".to_string(),
        })?;
        let z = model.standardizer.apply(&input);

        let horizons = model
            .horizons
            .iter()
            .enumerate()
            .map(|(i, hm)| {
                let raw = hm.predict(&z);
                let margin = 1.96 * hm.residual_std;
                HorizonPrediction {
                    horizon_bucket: i + 1,
                    congestion_index: raw.clamp(0.0, 1.0),
                    level: CongestionLevel::from_index(raw.clamp(0.0, 1.0)),
                    interval: ConfidenceInterval {
                        lower: (raw - margin).clamp(0.0, 1.0),
                        upper: (raw + margin).clamp(0.0, 1.0),
                    },
                }
            })
            .collect();

        Ok(ForecastResult {
            segment_id: segment_id.to_string(),
            issued_at: Utc::now(),
            schema_version: FEATURE_SCHEMA_VERSION,
            model_version: model.model_version,
            degraded: false,
            horizons,
        })
    }

    /// Prediction with the documented fallback: missing model, schema
    /// mismatch, or an unusable window degrade to the historical baseline
    /// instead of failing the caller. A segment the baseline has never seen
    /// still fails with `UnknownEntity`.
    pub fn forecast(
        &self,
        profiles: &ProfileStore,
        segment_id: &str,
        window: &[FeatureVector],
        anchor: DateTime<Utc>,
    ) -> Result<ForecastResult, EngineError> {
        match self.predict(segment_id, window) {
            Ok(result) => Ok(result),
            Err(
                err @ (EngineError::ModelUnavailable(_)
                | EngineError::SchemaVersionMismatch { .. }
                | EngineError::InsufficientData { .. }),
            ) => {
                warn!(segment_id, error = %err, "Model prediction unavailable, serving baseline");
                baseline::baseline_forecast(
                    profiles,
                    segment_id,
                    anchor,
                    self.horizon_buckets,
                    self.bucket_width_s,
                )
            }
            Err(other) => Err(other),
        }
    }

    /// Baseline-only path, used when the model path timed out.
    pub fn baseline(
        &self,
        profiles: &ProfileStore,
        segment_id: &str,
        anchor: DateTime<Utc>,
    ) -> Result<ForecastResult, EngineError> {
        baseline::baseline_forecast(
            profiles,
            segment_id,
            anchor,
            self.horizon_buckets,
            self.bucket_width_s,
        )
    }
}
