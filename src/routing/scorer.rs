//! Multi-criteria route scoring.
//!
//! Expected travel time comes from the congestion level of each leg's
//! segment (first forecast horizon, falling back to the live congestion
//! index), expected emissions from the per-mode factors. Both criteria are
//! min-max normalized within the request's scored set and combined with the
//! configured weights. A route with a leg that has neither a usable forecast
//! nor a live signal is reported unscorable, never silently scored.

use super::emissions::{base_speed_kmh, emission_factor_g_per_km};
use super::{Route, RouteScore, UnscorableRoute};
use crate::config::ScoreWeights;
use crate::features::FEATURE_SCHEMA_VERSION;
use crate::forecast::{CongestionLevel, ForecastResult};
use std::collections::HashMap;
use tracing::warn;

/// Fraction of the mode's base speed still available per congestion level.
pub fn speed_factor(level: CongestionLevel) -> f64 {
    match level {
        CongestionLevel::Free => 1.0,
        CongestionLevel::Moderate => 0.7,
        CongestionLevel::Heavy => 0.45,
        CongestionLevel::Jam => 0.25,
    }
}

pub struct RouteScorer {
    weights: ScoreWeights,
}

struct Candidate<'a> {
    route: &'a Route,
    time_s: f64,
    emission_g: f64,
}

impl RouteScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    /// Scores `routes` against the request's forecast snapshot and live
    /// congestion indexes. The returned ranking is a stable total order:
    /// composite ascending, ties by lower emission, then shorter route, then
    /// input order.
    pub fn score(
        &self,
        routes: &[Route],
        forecasts: &HashMap<String, ForecastResult>,
        live: &HashMap<String, f64>,
    ) -> (Vec<RouteScore>, Vec<UnscorableRoute>) {
        let mut candidates = Vec::with_capacity(routes.len());
        let mut unscorable = Vec::new();

        for route in routes {
            match self.travel_time_s(route, forecasts, live) {
                Ok(time_s) => candidates.push(Candidate {
                    route,
                    time_s,
                    emission_g: route.total_length_km() * emission_factor_g_per_km(route.mode),
                }),
                Err(reason) => unscorable.push(UnscorableRoute {
                    route_id: route.id.clone(),
                    reason,
                }),
            }
        }

        let (tmin, tmax) = min_max(candidates.iter().map(|c| c.time_s));
        let (emin, emax) = min_max(candidates.iter().map(|c| c.emission_g));

        let mut ranked: Vec<RouteScore> = candidates
            .iter()
            .map(|c| {
                let normalized_time = normalize(c.time_s, tmin, tmax);
                let normalized_emission = normalize(c.emission_g, emin, emax);
                RouteScore {
                    route_id: c.route.id.clone(),
                    mode: c.route.mode,
                    expected_travel_time_s: c.time_s,
                    expected_emission_g: c.emission_g,
                    normalized_time,
                    normalized_emission,
                    composite_score: self.weights.w_time * normalized_time
                        + self.weights.w_emission * normalized_emission,
                    rank: 0,
                }
            })
            .collect();

        // Stable sort: full ties keep input order.
        let lengths: HashMap<&str, f64> = candidates
            .iter()
            .map(|c| (c.route.id.as_str(), c.route.total_length_km()))
            .collect();
        ranked.sort_by(|a, b| {
            a.composite_score
                .total_cmp(&b.composite_score)
                .then_with(|| a.expected_emission_g.total_cmp(&b.expected_emission_g))
                .then_with(|| {
                    lengths[a.route_id.as_str()].total_cmp(&lengths[b.route_id.as_str()])
                })
        });
        for (i, score) in ranked.iter_mut().enumerate() {
            score.rank = i + 1;
        }

        (ranked, unscorable)
    }

    fn travel_time_s(
        &self,
        route: &Route,
        forecasts: &HashMap<String, ForecastResult>,
        live: &HashMap<String, f64>,
    ) -> Result<f64, String> {
        let mut time_s = 0.0;
        for leg in &route.legs {
            let level = segment_level(&leg.segment_id, forecasts, live).ok_or_else(|| {
                format!("no congestion signal for segment {:?}", leg.segment_id)
            })?;
            let speed_kmh = base_speed_kmh(route.mode) * speed_factor(level);
            time_s += leg.length_km / speed_kmh * 3600.0;
        }
        Ok(time_s)
    }
}

/// First forecast horizon when present and schema-compatible, otherwise the
/// live congestion index.
fn segment_level(
    segment_id: &str,
    forecasts: &HashMap<String, ForecastResult>,
    live: &HashMap<String, f64>,
) -> Option<CongestionLevel> {
    if let Some(forecast) = forecasts.get(segment_id) {
        if forecast.schema_version != FEATURE_SCHEMA_VERSION {
            warn!(
                segment_id,
                found = forecast.schema_version,
                expected = FEATURE_SCHEMA_VERSION,
                "Ignoring forecast with mismatched feature schema"
            );
        } else if let Some(first) = forecast.horizons.first() {
            return Some(first.level);
        }
    }
    live.get(segment_id)
        .map(|index| CongestionLevel::from_index(*index))
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    })
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max > min {
        (value - min) / (max - min)
    } else {
        // All candidates equal on this criterion.
        0.0
    }
}
