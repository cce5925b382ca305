//! Engine facade.
//!
//! Owns the timeline store, historical profiles, feature builder,
//! forecaster, and route catalog, and exposes the query surface the
//! presentation layer consumes: `ingest`, `get_forecast`,
//! `get_recommendations`, training, and state save/load. The async variants
//! offload model inference to the blocking pool under the configured
//! timeout and degrade to the baseline when it elapses.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::features::{FeatureBuilder, FeatureVector};
use crate::forecast::model::{self, ModelArtifact, TrainingExample};
use crate::forecast::{ForecastResult, Forecaster};
use crate::normalize::normalize;
use crate::profile::{ProfileSlot, ProfileStore};
use crate::routing::scorer::RouteScorer;
use crate::routing::{RecommendationResponse, Route, RouteCatalog, TransportMode};
use crate::timeline::{AppendOutcome, SegmentTimeline, TimelineStore};
use crate::types::{SourceKind, metric};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

const STATE_VERSION: u32 = 1;

/// Persisted engine state: timelines plus profile slots, as one JSON file.
#[derive(Debug, Serialize, Deserialize)]
pub struct EngineState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub timelines: Vec<SegmentTimeline>,
    pub profile_slots: Vec<ProfileSlot>,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    store: TimelineStore,
    profiles: ProfileStore,
    builder: FeatureBuilder,
    forecaster: Forecaster,
    catalog: RwLock<Option<RouteCatalog>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        Self {
            store: TimelineStore::new(config.retention_window_s),
            profiles: ProfileStore::new(),
            builder: FeatureBuilder::new(Arc::clone(&config)),
            forecaster: Forecaster::new(config.horizon_buckets, config.bucket_width_s),
            catalog: RwLock::new(None),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Normalizes and appends one raw payload. Newly inserted records also
    /// feed the historical profiles; duplicate upgrades do not, so a slot
    /// never counts the same timestamp twice.
    pub fn ingest(
        &self,
        source_kind: SourceKind,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<AppendOutcome, EngineError> {
        let record = normalize(payload, source_kind, received_at, &self.config)?;
        if record.source_kind == SourceKind::Traffic && record.congestion_index().is_none() {
            debug!(
                entity_id = record.entity_id,
                "Traffic record carries no derivable congestion index"
            );
        }
        let observed = record.clone();
        let outcome = self.store.append(record);
        if outcome == AppendOutcome::Inserted {
            self.profiles.observe(&observed);
        }
        Ok(outcome)
    }

    pub fn record_count(&self) -> usize {
        self.store.record_count()
    }

    /// Segment ids with a traffic timeline, sorted.
    pub fn traffic_segments(&self) -> Vec<String> {
        self.store.entity_ids(SourceKind::Traffic)
    }

    pub fn reload_model(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let artifact = ModelArtifact::load(path)?;
        info!(
            model_version = artifact.model_version,
            schema_version = artifact.schema_version,
            "Loaded model artifact"
        );
        self.forecaster.install_model(artifact);
        Ok(())
    }

    pub fn load_catalog(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let catalog = RouteCatalog::load(path)?;
        info!(pairs = catalog.entries.len(), "Loaded route catalog");
        let mut slot = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(catalog);
        Ok(())
    }

    pub fn set_catalog(&self, catalog: RouteCatalog) {
        let mut slot = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(catalog);
    }

    /// Forecast anchor for a segment: its newest traffic timestamp, floored
    /// to the bucket grid. Keeps replayed and live runs on the same anchors.
    fn anchor_time(&self, segment_id: &str) -> Result<DateTime<Utc>, EngineError> {
        let latest = self
            .store
            .latest_timestamp(segment_id, SourceKind::Traffic)
            .ok_or_else(|| EngineError::UnknownEntity {
                entity_id: segment_id.to_string(),
                kind: SourceKind::Traffic,
            })?;
        Ok(floor_to_bucket(latest, self.config.bucket_width_s))
    }

    /// History window ending at `anchor`, oldest first. Buckets that cannot
    /// be built are skipped; the forecaster degrades when nothing remains.
    fn window_features(&self, segment_id: &str, anchor: DateTime<Utc>) -> Vec<FeatureVector> {
        let width = self.config.bucket_width_s;
        (0..self.config.history_window)
            .rev()
            .filter_map(|back| {
                let bucket_time = anchor - Duration::seconds(width * back as i64);
                self.builder
                    .build(&self.store, &self.profiles, segment_id, bucket_time)
                    .ok()
            })
            .collect()
    }

    /// Synchronous forecast for one segment, model path with baseline
    /// degradation.
    pub fn get_forecast(&self, segment_id: &str) -> Result<ForecastResult, EngineError> {
        let anchor = self.anchor_time(segment_id)?;
        let window = self.window_features(segment_id, anchor);
        self.forecaster
            .forecast(&self.profiles, segment_id, &window, anchor)
    }

    /// Async forecast applying `inference_timeout_ms`: the model path runs
    /// on the blocking pool, and an elapsed timeout serves the baseline
    /// instead of keeping the caller waiting.
    pub async fn get_forecast_with_timeout(
        self: Arc<Self>,
        segment_id: &str,
    ) -> Result<ForecastResult, EngineError> {
        let anchor = self.anchor_time(segment_id)?;
        let engine = Arc::clone(&self);
        let segment = segment_id.to_string();
        let task = tokio::task::spawn_blocking(move || engine.get_forecast(&segment));

        let timeout = std::time::Duration::from_millis(self.config.inference_timeout_ms);
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                warn!(segment_id, error = %join_error, "Forecast task failed, serving baseline");
                self.forecaster.baseline(&self.profiles, segment_id, anchor)
            }
            Err(_) => {
                warn!(
                    segment_id,
                    timeout_ms = self.config.inference_timeout_ms,
                    "Forecast timed out, serving baseline"
                );
                self.forecaster.baseline(&self.profiles, segment_id, anchor)
            }
        }
    }

    /// Candidate routes for the pair, filtered by mode preferences (empty
    /// slice keeps every mode).
    fn candidate_routes(
        &self,
        origin: &str,
        destination: &str,
        modes: &[TransportMode],
    ) -> Result<Vec<Route>, EngineError> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let catalog = catalog
            .as_ref()
            .ok_or_else(|| EngineError::Config("no route catalog loaded".to_string()))?;
        let routes = catalog.candidates(origin, destination).ok_or_else(|| {
            EngineError::UnknownRoutePair {
                origin: origin.to_string(),
                destination: destination.to_string(),
            }
        })?;
        Ok(routes
            .iter()
            .filter(|r| modes.is_empty() || modes.contains(&r.mode))
            .cloned()
            .collect())
    }

    /// Per-request snapshot: one forecast and one live congestion index per
    /// distinct segment, taken before any route is scored. Segments the
    /// engine cannot answer for are left out and surface as unscorable
    /// routes.
    fn condition_snapshot(
        &self,
        routes: &[Route],
    ) -> (HashMap<String, ForecastResult>, HashMap<String, f64>) {
        let segments: BTreeSet<&str> = routes
            .iter()
            .flat_map(|r| r.legs.iter().map(|l| l.segment_id.as_str()))
            .collect();

        let mut forecasts = HashMap::new();
        let mut live = HashMap::new();
        for segment in segments {
            match self.get_forecast(segment) {
                Ok(forecast) => {
                    forecasts.insert(segment.to_string(), forecast);
                }
                Err(err) => {
                    debug!(segment, error = %err, "No forecast for segment in request")
                }
            }
            if let Some(index) = self.live_congestion(segment) {
                live.insert(segment.to_string(), index);
            }
        }
        (forecasts, live)
    }

    /// Congestion index at the segment's newest traffic record, if fresh
    /// enough to use.
    fn live_congestion(&self, segment_id: &str) -> Option<f64> {
        let latest = self.store.latest_timestamp(segment_id, SourceKind::Traffic)?;
        let values = self
            .store
            .query(
                segment_id,
                SourceKind::Traffic,
                latest,
                self.config.max_staleness_s.traffic,
            )
            .ok()?;
        let speed = values.get(metric::SPEED_KMH)?;
        let free_flow = values.get(metric::FREE_FLOW_KMH)?;
        if *free_flow <= 0.0 {
            return None;
        }
        Some((1.0 - speed / free_flow).clamp(0.0, 1.0))
    }

    /// Ranked route recommendations for one origin/destination pair.
    pub fn get_recommendations(
        &self,
        origin: &str,
        destination: &str,
        modes: &[TransportMode],
    ) -> Result<RecommendationResponse, EngineError> {
        let routes = self.candidate_routes(origin, destination, modes)?;
        let (forecasts, live) = self.condition_snapshot(&routes);
        let scorer = RouteScorer::new(self.config.weights);
        let (ranked, unscorable) = scorer.score(&routes, &forecasts, &live);
        Ok(RecommendationResponse {
            origin: origin.to_string(),
            destination: destination.to_string(),
            issued_at: Utc::now(),
            ranked,
            unscorable,
        })
    }

    /// Async recommendations; per-segment forecasts go through the
    /// inference timeout.
    pub async fn get_recommendations_with_timeout(
        self: Arc<Self>,
        origin: &str,
        destination: &str,
        modes: &[TransportMode],
    ) -> Result<RecommendationResponse, EngineError> {
        let routes = self.candidate_routes(origin, destination, modes)?;

        let segments: BTreeSet<String> = routes
            .iter()
            .flat_map(|r| r.legs.iter().map(|l| l.segment_id.clone()))
            .collect();
        let mut forecasts = HashMap::new();
        let mut live = HashMap::new();
        for segment in segments {
            match Arc::clone(&self).get_forecast_with_timeout(&segment).await {
                Ok(forecast) => {
                    forecasts.insert(segment.clone(), forecast);
                }
                Err(err) => debug!(segment, error = %err, "No forecast for segment in request"),
            }
            if let Some(index) = self.live_congestion(&segment) {
                live.insert(segment, index);
            }
        }

        let scorer = RouteScorer::new(self.config.weights);
        let (ranked, unscorable) = scorer.score(&routes, &forecasts, &live);
        Ok(RecommendationResponse {
            origin: origin.to_string(),
            destination: destination.to_string(),
            issued_at: Utc::now(),
            ranked,
            unscorable,
        })
    }

    /// Builds the supervised training set from the replayed timelines: for
    /// every segment and every anchor bucket with a complete history
    /// window, the targets are the observed congestion indexes of the next
    /// K buckets.
    pub fn build_training_set(&self) -> Result<Vec<TrainingExample>, EngineError> {
        let width = self.config.bucket_width_s;
        let w = self.config.history_window;
        let k = self.config.horizon_buckets;

        let mut examples = Vec::new();
        for segment in self.store.entity_ids(SourceKind::Traffic) {
            let Some((first, last)) = self.store.time_bounds(&segment, SourceKind::Traffic) else {
                continue;
            };
            let start = floor_to_bucket(first, width);
            let end = floor_to_bucket(last, width);

            let mut anchor = start + Duration::seconds(width * (w as i64 - 1));
            let last_anchor = end - Duration::seconds(width * k as i64);
            while anchor <= last_anchor {
                if let Some(example) = self.training_example(&segment, anchor) {
                    examples.push(example);
                }
                anchor += Duration::seconds(width);
            }
        }
        Ok(examples)
    }

    /// One example per (segment, anchor); `None` when any window or target
    /// bucket cannot be built.
    fn training_example(&self, segment_id: &str, anchor: DateTime<Utc>) -> Option<TrainingExample> {
        let width = self.config.bucket_width_s;
        let mut window = Vec::with_capacity(self.config.history_window);
        for back in (0..self.config.history_window).rev() {
            let bucket_time = anchor - Duration::seconds(width * back as i64);
            window.push(
                self.builder
                    .build(&self.store, &self.profiles, segment_id, bucket_time)
                    .ok()?,
            );
        }
        let input = model::model_input(&window)?;

        let mut targets = Vec::with_capacity(self.config.horizon_buckets);
        for ahead in 1..=self.config.horizon_buckets {
            let bucket_time = anchor + Duration::seconds(width * ahead as i64);
            let fv = self
                .builder
                .build(&self.store, &self.profiles, segment_id, bucket_time)
                .ok()?;
            targets.push(fv.value(metric::CONGESTION)?);
        }
        Some(TrainingExample { input, targets })
    }

    /// Trains a fresh artifact from the current state, saves it, and
    /// installs it for serving.
    pub fn train_model(&self, output: impl AsRef<Path>) -> Result<ModelArtifact, EngineError> {
        let examples = self.build_training_set()?;
        info!(examples = examples.len(), "Built training set");
        let artifact = model::fit_model(
            &examples,
            self.config.horizon_buckets,
            self.config.history_window,
            self.config.bucket_width_s,
        )?;
        artifact.save(output.as_ref())?;
        info!(path = %output.as_ref().display(), "Saved model artifact");
        self.forecaster.install_model(artifact.clone());
        Ok(artifact)
    }

    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        let state = EngineState {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            timelines: self.store.snapshot(),
            profile_slots: self.profiles.snapshot(),
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(&state)?)?;
        info!(
            path = %path.display(),
            timelines = state.timelines.len(),
            "Saved engine state"
        );
        Ok(())
    }

    pub fn load_state(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let state: EngineState = serde_json::from_str(&content)?;
        if state.version != STATE_VERSION {
            return Err(EngineError::Config(format!(
                "engine state version {} is not supported (expected {STATE_VERSION})",
                state.version
            )));
        }
        info!(
            path = %path.as_ref().display(),
            timelines = state.timelines.len(),
            saved_at = %state.saved_at,
            "Restoring engine state"
        );
        self.store.restore(state.timelines);
        self.profiles.restore(state.profile_slots);
        Ok(())
    }
}

fn floor_to_bucket(at: DateTime<Utc>, width_s: i64) -> DateTime<Utc> {
    let secs = at.timestamp();
    let floored = secs - secs.rem_euclid(width_s);
    DateTime::from_timestamp(floored, 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{CatalogEntry, RouteLeg};
    use chrono::TimeZone;
    use serde_json::json;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.history_window = 3;
        config.horizon_buckets = 2;
        config.weather_fallback_entity = Some("la-defense".to_string());
        config
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    }

    /// Replays `buckets` five-minute traffic buckets for two segments plus
    /// one weather observation per hour.
    fn seeded_engine(buckets: usize) -> Engine {
        let engine = Engine::new(test_config());
        let start = base_time();

        for i in 0..buckets {
            let at = start + Duration::seconds(300 * i as i64);
            let received = at + Duration::seconds(10);
            for (segment, base_speed) in [("S1", 50.0), ("S2", 40.0)] {
                let speed = base_speed - (i % 5) as f64 * 4.0;
                let payload = json!({
                    "segment_id": segment,
                    "timestamp": at.to_rfc3339(),
                    "flow": {"current_speed": speed, "free_flow_speed": base_speed}
                });
                engine
                    .ingest(SourceKind::Traffic, &payload, received)
                    .unwrap();
            }
            if i % 12 == 0 {
                let payload = json!({
                    "station_id": "la-defense",
                    "observed_at": at.to_rfc3339(),
                    "temp": {"value": 6.0},
                    "humidity_pct": 75.0,
                    "precip": {"value": 0.0},
                    "wind": {"value": 10.0}
                });
                engine
                    .ingest(SourceKind::Weather, &payload, received)
                    .unwrap();
            }
        }
        engine
    }

    fn catalog() -> RouteCatalog {
        RouteCatalog {
            entries: vec![CatalogEntry {
                origin: "esplanade".to_string(),
                destination: "grande-arche".to_string(),
                routes: vec![
                    Route {
                        id: "drive".to_string(),
                        mode: TransportMode::Car,
                        legs: vec![RouteLeg {
                            segment_id: "S1".to_string(),
                            length_km: 4.0,
                        }],
                    },
                    Route {
                        id: "metro".to_string(),
                        mode: TransportMode::Metro,
                        legs: vec![RouteLeg {
                            segment_id: "S2".to_string(),
                            length_km: 5.0,
                        }],
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_malformed_payload_is_rejected_not_stored() {
        let engine = Engine::new(test_config());
        let err = engine
            .ingest(SourceKind::Traffic, &json!({"segment_id": "S1"}), base_time())
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedSourceData { .. }));
        assert_eq!(engine.record_count(), 0);
    }

    #[test]
    fn test_forecast_before_training_is_degraded_baseline() {
        let engine = seeded_engine(20);
        let forecast = engine.get_forecast("S1").unwrap();
        assert!(forecast.degraded);
        assert_eq!(forecast.model_version, 0);
        assert_eq!(forecast.horizons.len(), 2);
    }

    #[test]
    fn test_forecast_unknown_segment_fails() {
        let engine = seeded_engine(20);
        assert!(matches!(
            engine.get_forecast("S9"),
            Err(EngineError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_train_then_forecast_uses_model() {
        let engine = seeded_engine(20);
        let dir = tempfile::tempdir().unwrap();
        let artifact = engine.train_model(dir.path().join("model.json")).unwrap();
        assert_eq!(artifact.horizons.len(), 2);
        assert!(artifact.training_samples >= 10);

        let forecast = engine.get_forecast("S1").unwrap();
        assert!(!forecast.degraded);
        assert_eq!(forecast.model_version, artifact.model_version);
        assert_eq!(forecast.horizons.len(), 2);
        for h in &forecast.horizons {
            assert!((0.0..=1.0).contains(&h.congestion_index));
            assert!(h.interval.lower <= h.congestion_index + 1e-12);
            assert!(h.interval.upper >= h.congestion_index - 1e-12);
        }
    }

    #[test]
    fn test_training_set_is_deterministic() {
        let engine = seeded_engine(16);
        let a = engine.build_training_set().unwrap();
        let b = engine.build_training_set().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.input, y.input);
            assert_eq!(x.targets, y.targets);
        }
    }

    #[test]
    fn test_recommendations_rank_all_candidates() {
        let engine = seeded_engine(20);
        engine.set_catalog(catalog());

        let response = engine
            .get_recommendations("esplanade", "grande-arche", &[])
            .unwrap();
        assert_eq!(response.ranked.len(), 2);
        assert!(response.unscorable.is_empty());
        assert_eq!(response.ranked[0].rank, 1);
        assert_eq!(response.ranked[1].rank, 2);

        // mode preference narrows the candidate set
        let metro_only = engine
            .get_recommendations("esplanade", "grande-arche", &[TransportMode::Metro])
            .unwrap();
        assert_eq!(metro_only.ranked.len(), 1);
        assert_eq!(metro_only.ranked[0].route_id, "metro");
    }

    #[test]
    fn test_recommendations_unknown_pair_fails() {
        let engine = seeded_engine(4);
        engine.set_catalog(catalog());
        assert!(matches!(
            engine.get_recommendations("esplanade", "nowhere", &[]),
            Err(EngineError::UnknownRoutePair { .. })
        ));
        assert!(matches!(
            Engine::new(test_config()).get_recommendations("a", "b", &[]),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_state_round_trip_preserves_forecasts() {
        let engine = seeded_engine(12);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        engine.save_state(&path).unwrap();

        let restored = Engine::new(test_config());
        restored.load_state(&path).unwrap();
        assert_eq!(restored.record_count(), engine.record_count());

        let before = engine.get_forecast("S1").unwrap();
        let after = restored.get_forecast("S1").unwrap();
        assert_eq!(before.horizons, after.horizons);
    }

    #[tokio::test]
    async fn test_async_forecast_matches_sync_within_timeout() {
        let engine = Arc::new(seeded_engine(20));
        let dir = tempfile::tempdir().unwrap();
        engine.train_model(dir.path().join("model.json")).unwrap();

        let sync = engine.get_forecast("S1").unwrap();
        let with_timeout = Arc::clone(&engine)
            .get_forecast_with_timeout("S1")
            .await
            .unwrap();
        assert_eq!(sync.horizons, with_timeout.horizons);
        assert!(!with_timeout.degraded);
    }

    #[tokio::test]
    async fn test_zero_timeout_still_answers_with_baseline() {
        let mut config = test_config();
        config.inference_timeout_ms = 0;
        let engine = Engine::new(config);
        let start = base_time();
        for i in 0..4 {
            let at = start + Duration::seconds(300 * i);
            let payload = json!({
                "segment_id": "S1",
                "timestamp": at.to_rfc3339(),
                "flow": {"current_speed": 30.0, "free_flow_speed": 50.0}
            });
            engine
                .ingest(SourceKind::Traffic, &payload, at + Duration::seconds(5))
                .unwrap();
        }
        let engine = Arc::new(engine);

        let forecast = Arc::clone(&engine)
            .get_forecast_with_timeout("S1")
            .await
            .unwrap();
        assert!(forecast.degraded);
        assert_eq!(forecast.horizons.len(), 2);
    }
}
