//! Historical-average baseline.
//!
//! Serves a degraded forecast from the profile store when the model path is
//! unavailable: each horizon takes the congestion mean of its (day-of-week,
//! hour) slot, with the interval widened by the slot's standard deviation.

use super::{CongestionLevel, ConfidenceInterval, ForecastResult, HorizonPrediction};
use crate::error::EngineError;
use crate::features::FEATURE_SCHEMA_VERSION;
use crate::profile::ProfileStore;
use crate::types::{SourceKind, metric};
use chrono::{DateTime, Duration, Utc};

pub fn baseline_forecast(
    profiles: &ProfileStore,
    segment_id: &str,
    anchor: DateTime<Utc>,
    horizon_buckets: usize,
    bucket_width_s: i64,
) -> Result<ForecastResult, EngineError> {
    let mut horizons = Vec::with_capacity(horizon_buckets);
    for k in 1..=horizon_buckets {
        let slot_time = anchor + Duration::seconds(bucket_width_s * k as i64);
        let summary = profiles
            .summary_at(segment_id, SourceKind::Traffic, metric::CONGESTION, slot_time)
            .ok_or_else(|| EngineError::UnknownEntity {
                entity_id: segment_id.to_string(),
                kind: SourceKind::Traffic,
            })?;

        let index = summary.mean.clamp(0.0, 1.0);
        let margin = 1.96 * summary.std;
        horizons.push(HorizonPrediction {
            horizon_bucket: k,
            congestion_index: index,
            level: CongestionLevel::from_index(index),
            interval: ConfidenceInterval {
                lower: (summary.mean - margin).clamp(0.0, 1.0),
                upper: (summary.mean + margin).clamp(0.0, 1.0),
            },
        });
    }

    Ok(ForecastResult {
        segment_id: segment_id.to_string(),
        issued_at: Utc::now(),
        schema_version: FEATURE_SCHEMA_VERSION,
        model_version: 0,
        degraded: true,
        horizons,
    })
}
