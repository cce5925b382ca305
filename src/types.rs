//! Core record types shared across the fusion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Canonical metric names used in [`NormalizedRecord::value_map`] and the
/// feature schema. All producers are coerced onto these names and units.
pub mod metric {
    pub const SPEED_KMH: &str = "speed_kmh";
    pub const FREE_FLOW_KMH: &str = "free_flow_kmh";
    pub const TEMP_C: &str = "temp_c";
    pub const PRECIP_MM: &str = "precip_mm";
    pub const WIND_KMH: &str = "wind_kmh";
    pub const HUMIDITY_PCT: &str = "humidity_pct";
    pub const DELAY_S: &str = "delay_s";

    /// Derived congestion index `1 - speed/free_flow`, clamped to [0, 1].
    /// Tracked in historical profiles, never stored in a record.
    pub const CONGESTION: &str = "congestion";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Traffic,
    Weather,
    Transit,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Traffic, SourceKind::Weather, SourceKind::Transit];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Traffic => "traffic",
            SourceKind::Weather => "weather",
            SourceKind::Transit => "transit",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traffic" => Ok(SourceKind::Traffic),
            "weather" => Ok(SourceKind::Weather),
            "transit" => Ok(SourceKind::Transit),
            other => Err(format!("unknown source kind {other:?}")),
        }
    }
}

/// Observation quality. Variant order encodes trust: a record may overwrite
/// a same-timestamp record only if its quality is strictly greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Stale,
    Estimated,
    Measured,
}

/// A source payload mapped onto the canonical shape. Immutable once created.
///
/// `value_map` is a `BTreeMap` so that iteration order, and everything
/// derived from it, is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_kind: SourceKind,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub value_map: BTreeMap<String, f64>,
    pub quality: Quality,
}

impl NormalizedRecord {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.value_map.get(metric).copied()
    }

    /// Congestion index derived from speed against free-flow speed, when the
    /// record carries both.
    pub fn congestion_index(&self) -> Option<f64> {
        let speed = self.value(metric::SPEED_KMH)?;
        let free_flow = self.value(metric::FREE_FLOW_KMH)?;
        if free_flow <= 0.0 {
            return None;
        }
        Some((1.0 - speed / free_flow).clamp(0.0, 1.0))
    }
}
