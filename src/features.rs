//! Feature construction.
//!
//! Joins the traffic, weather, and transit timelines into one fixed-schema
//! feature vector per segment per time bucket. The field order is frozen and
//! versioned; training and inference both refuse to mix schema versions.
//!
//! Gap-fill policy, applied per metric in this order, identically during
//! training replay and live serving:
//! 1. aligned value from the source's own timeline;
//! 2. historical profile mean for the (day-of-week, hour) slot;
//! 3. declared default from configuration;
//! 4. `InsufficientData`.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::profile::{ProfileStore, slot_of};
use crate::timeline::TimelineStore;
use crate::types::{SourceKind, metric};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Schema v1 field order. Append-only across versions; any reorder bumps
/// [`FEATURE_SCHEMA_VERSION`].
pub const FEATURE_FIELDS: [&str; 12] = [
    metric::SPEED_KMH,
    metric::FREE_FLOW_KMH,
    metric::CONGESTION,
    metric::TEMP_C,
    metric::PRECIP_MM,
    metric::WIND_KMH,
    metric::HUMIDITY_PCT,
    metric::DELAY_S,
    "hour_of_day",
    "day_of_week",
    "is_weekend",
    "is_rush_hour",
];

const WEATHER_METRICS: [&str; 4] = [
    metric::TEMP_C,
    metric::PRECIP_MM,
    metric::WIND_KMH,
    metric::HUMIDITY_PCT,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub segment_id: String,
    pub bucket_time: DateTime<Utc>,
    pub schema_version: u32,
    /// Values in [`FEATURE_FIELDS`] order.
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn value(&self, field: &str) -> Option<f64> {
        let idx = FEATURE_FIELDS.iter().position(|f| *f == field)?;
        self.values.get(idx).copied()
    }
}

#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    config: Arc<EngineConfig>,
}

impl FeatureBuilder {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Builds the feature vector for `segment_id` at `bucket_time`.
    /// Deterministic: identical store/profile state yields an identical
    /// vector.
    pub fn build(
        &self,
        store: &TimelineStore,
        profiles: &ProfileStore,
        segment_id: &str,
        bucket_time: DateTime<Utc>,
    ) -> Result<FeatureVector, EngineError> {
        let staleness = &self.config.max_staleness_s;

        let traffic = store
            .query(
                segment_id,
                SourceKind::Traffic,
                bucket_time,
                staleness.traffic,
            )
            .ok();
        let weather = self.query_chain(
            store,
            segment_id,
            SourceKind::Weather,
            self.config.weather_fallback_entity.as_deref(),
            bucket_time,
        );
        let transit = self.query_chain(
            store,
            segment_id,
            SourceKind::Transit,
            self.config.transit_fallback_entity.as_deref(),
            bucket_time,
        );

        let resolve = |kind: SourceKind,
                       aligned: &Option<BTreeMap<String, f64>>,
                       fallback_entity: Option<&str>,
                       name: &str|
         -> Result<f64, EngineError> {
            if let Some(map) = aligned
                && let Some(v) = map.get(name)
            {
                return Ok(*v);
            }
            let entities = [Some(segment_id), fallback_entity];
            for entity in entities.into_iter().flatten() {
                if let Some(summary) = profiles.summary_at(entity, kind, name, bucket_time) {
                    return Ok(summary.mean);
                }
            }
            if let Some(v) = self.config.fallback_defaults.get(name) {
                return Ok(*v);
            }
            Err(EngineError::InsufficientData {
                scope: segment_id.to_string(),
                missing: name.to_string(),
            })
        };

        let speed = resolve(SourceKind::Traffic, &traffic, None, metric::SPEED_KMH)?;
        let free_flow = resolve(SourceKind::Traffic, &traffic, None, metric::FREE_FLOW_KMH)?;
        if free_flow <= 0.0 {
            return Err(EngineError::InsufficientData {
                scope: segment_id.to_string(),
                missing: metric::CONGESTION.to_string(),
            });
        }
        let congestion = (1.0 - speed / free_flow).clamp(0.0, 1.0);

        let mut values = Vec::with_capacity(FEATURE_FIELDS.len());
        values.push(speed);
        values.push(free_flow);
        values.push(congestion);
        for name in WEATHER_METRICS {
            values.push(resolve(
                SourceKind::Weather,
                &weather,
                self.config.weather_fallback_entity.as_deref(),
                name,
            )?);
        }
        values.push(resolve(
            SourceKind::Transit,
            &transit,
            self.config.transit_fallback_entity.as_deref(),
            metric::DELAY_S,
        )?);

        let (dow, hour) = slot_of(bucket_time);
        values.push(hour as f64);
        values.push(dow as f64);
        values.push(if dow >= 5 { 1.0 } else { 0.0 });
        values.push(if is_rush_hour(hour) { 1.0 } else { 0.0 });

        Ok(FeatureVector {
            segment_id: segment_id.to_string(),
            bucket_time,
            schema_version: FEATURE_SCHEMA_VERSION,
            values,
        })
    }

    /// Aligned lookup under the segment's own id, then under the configured
    /// fallback entity (e.g. one district-wide weather station).
    fn query_chain(
        &self,
        store: &TimelineStore,
        segment_id: &str,
        kind: SourceKind,
        fallback_entity: Option<&str>,
        at_time: DateTime<Utc>,
    ) -> Option<BTreeMap<String, f64>> {
        let staleness = self.config.max_staleness_s.for_kind(kind);
        let entities = [Some(segment_id), fallback_entity];
        for entity in entities.into_iter().flatten() {
            if let Ok(map) = store.query(entity, kind, at_time, staleness) {
                return Some(map);
            }
        }
        None
    }
}

/// Morning (07:00-09:59) and evening (17:00-19:59) peaks.
fn is_rush_hour(hour: u8) -> bool {
    matches!(hour, 7..=9 | 17..=19)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NormalizedRecord, Quality};
    use chrono::TimeZone;

    fn record(
        kind: SourceKind,
        entity: &str,
        at: DateTime<Utc>,
        values: &[(&str, f64)],
    ) -> NormalizedRecord {
        NormalizedRecord {
            source_kind: kind,
            entity_id: entity.to_string(),
            timestamp: at,
            value_map: values
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            quality: Quality::Measured,
        }
    }

    fn monday(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap()
    }

    fn setup() -> (Arc<EngineConfig>, TimelineStore, ProfileStore) {
        let mut config = EngineConfig::default();
        config.weather_fallback_entity = Some("la-defense".to_string());
        (
            Arc::new(config),
            TimelineStore::new(7 * 24 * 3600),
            ProfileStore::new(),
        )
    }

    fn seed_full(store: &TimelineStore, at: DateTime<Utc>) {
        store.append(record(
            SourceKind::Traffic,
            "S1",
            at,
            &[(metric::SPEED_KMH, 40.0), (metric::FREE_FLOW_KMH, 50.0)],
        ));
        store.append(record(
            SourceKind::Weather,
            "la-defense",
            at,
            &[
                (metric::TEMP_C, 5.0),
                (metric::PRECIP_MM, 0.0),
                (metric::WIND_KMH, 12.0),
                (metric::HUMIDITY_PCT, 80.0),
            ],
        ));
        store.append(record(
            SourceKind::Transit,
            "S1",
            at,
            &[(metric::DELAY_S, 90.0)],
        ));
    }

    #[test]
    fn test_build_produces_schema_ordered_vector() {
        let (config, store, profiles) = setup();
        let at = monday(8, 0);
        seed_full(&store, at);

        let builder = FeatureBuilder::new(config);
        let fv = builder.build(&store, &profiles, "S1", at).unwrap();

        assert_eq!(fv.schema_version, FEATURE_SCHEMA_VERSION);
        assert_eq!(fv.values.len(), FEATURE_FIELDS.len());
        assert_eq!(fv.value(metric::SPEED_KMH), Some(40.0));
        assert_eq!(fv.value(metric::CONGESTION), Some(0.2));
        assert_eq!(fv.value(metric::TEMP_C), Some(5.0));
        assert_eq!(fv.value(metric::DELAY_S), Some(90.0));
        assert_eq!(fv.value("hour_of_day"), Some(8.0));
        assert_eq!(fv.value("day_of_week"), Some(0.0));
        assert_eq!(fv.value("is_weekend"), Some(0.0));
        assert_eq!(fv.value("is_rush_hour"), Some(1.0));
    }

    #[test]
    fn test_build_is_deterministic() {
        let (config, store, profiles) = setup();
        let at = monday(8, 0);
        seed_full(&store, at);

        let builder = FeatureBuilder::new(config);
        let first = builder.build(&store, &profiles, "S1", at).unwrap();
        let second = builder.build(&store, &profiles, "S1", at).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_weather_without_profile_or_default_fails() {
        let (config, store, profiles) = setup();
        let at = monday(8, 0);
        store.append(record(
            SourceKind::Traffic,
            "S1",
            at,
            &[(metric::SPEED_KMH, 40.0), (metric::FREE_FLOW_KMH, 50.0)],
        ));

        let builder = FeatureBuilder::new(config);
        let err = builder.build(&store, &profiles, "S1", at).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientData { ref missing, .. } if missing == metric::TEMP_C
        ));
    }

    #[test]
    fn test_stale_weather_falls_back_to_profile_slot() {
        let (config, store, profiles) = setup();
        let at = monday(8, 0);
        seed_full(&store, at);

        // Profile learns this slot, then the query moves past staleness.
        for tl in store.snapshot() {
            for r in tl.records() {
                profiles.observe(r);
            }
        }
        let later = at + chrono::Duration::hours(3);
        store.append(record(
            SourceKind::Traffic,
            "S1",
            later,
            &[(metric::SPEED_KMH, 30.0), (metric::FREE_FLOW_KMH, 50.0)],
        ));
        store.append(record(
            SourceKind::Transit,
            "S1",
            later,
            &[(metric::DELAY_S, 0.0)],
        ));

        let builder = FeatureBuilder::new(config);
        let fv = builder.build(&store, &profiles, "S1", later).unwrap();
        // 3h-old weather exceeds the 7200s staleness window; the profile
        // mean (single observation) answers instead.
        assert_eq!(fv.value(metric::TEMP_C), Some(5.0));
        assert_eq!(fv.value(metric::SPEED_KMH), Some(30.0));
    }

    #[test]
    fn test_configured_default_fills_missing_transit() {
        let (config, store, profiles) = setup();
        let at = monday(8, 0);
        store.append(record(
            SourceKind::Traffic,
            "S1",
            at,
            &[(metric::SPEED_KMH, 40.0), (metric::FREE_FLOW_KMH, 50.0)],
        ));
        store.append(record(
            SourceKind::Weather,
            "la-defense",
            at,
            &[
                (metric::TEMP_C, 5.0),
                (metric::PRECIP_MM, 0.0),
                (metric::WIND_KMH, 12.0),
                (metric::HUMIDITY_PCT, 80.0),
            ],
        ));

        let builder = FeatureBuilder::new(config);
        let fv = builder.build(&store, &profiles, "S1", at).unwrap();
        // No transit timeline anywhere; delay_s: 0 comes from
        // fallback_defaults.
        assert_eq!(fv.value(metric::DELAY_S), Some(0.0));
    }

    #[test]
    fn test_weekend_and_off_peak_flags() {
        let (config, store, profiles) = setup();
        // 2025-03-08 is a Saturday
        let at = Utc.with_ymd_and_hms(2025, 3, 8, 13, 0, 0).unwrap();
        seed_full(&store, at);

        let builder = FeatureBuilder::new(config);
        let fv = builder.build(&store, &profiles, "S1", at).unwrap();
        assert_eq!(fv.value("day_of_week"), Some(5.0));
        assert_eq!(fv.value("is_weekend"), Some(1.0));
        assert_eq!(fv.value("is_rush_hour"), Some(0.0));
    }
}
