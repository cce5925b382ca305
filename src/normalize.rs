//! Source record normalization.
//!
//! Maps raw payloads from the three feed families (traffic flow, weather
//! observations, transit delays) into [`NormalizedRecord`]s with canonical
//! units: km/h, °C, mm, seconds. Payload schemas are versioned here (v1).
//! Anything that cannot be normalized is rejected with
//! [`EngineError::MalformedSourceData`]; this module never fetches, retries,
//! or mutates shared state.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{NormalizedRecord, Quality, SourceKind, metric};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

const MPH_TO_KMH: f64 = 1.609_344;
const MS_TO_KMH: f64 = 3.6;
const IN_TO_MM: f64 = 25.4;

/// Traffic confidence below this demotes the record to `estimated`.
const CONFIDENCE_FLOOR: f64 = 0.5;

/// Normalizes one raw payload of the given kind.
///
/// `received_at` is the ingestion wall-clock time; records timestamped more
/// than `cfg.max_clock_skew_s` ahead of it are rejected rather than fused.
pub fn normalize(
    payload: &Value,
    source_kind: SourceKind,
    received_at: DateTime<Utc>,
    cfg: &EngineConfig,
) -> Result<NormalizedRecord, EngineError> {
    let record = match source_kind {
        SourceKind::Traffic => normalize_traffic(payload)?,
        SourceKind::Weather => normalize_weather(payload)?,
        SourceKind::Transit => normalize_transit(payload)?,
    };

    let skew_s = (record.timestamp - received_at).num_seconds();
    if skew_s > cfg.max_clock_skew_s {
        return Err(malformed(
            source_kind,
            format!(
                "timestamp {} is {skew_s}s ahead of ingestion time (max skew {}s)",
                record.timestamp, cfg.max_clock_skew_s
            ),
        ));
    }

    Ok(record)
}

/// Traffic flow payload, v1 (TomTom-flow shaped):
///
/// ```json
/// {
///   "segment_id": "S1",
///   "timestamp": "2025-03-03T08:00:00Z",
///   "flow": {"current_speed": 31.0, "free_flow_speed": 50.0,
///            "unit": "kmh", "confidence": 0.92}
/// }
/// ```
fn normalize_traffic(payload: &Value) -> Result<NormalizedRecord, EngineError> {
    let kind = SourceKind::Traffic;
    let entity_id = require_str(payload, "segment_id", kind)?;
    let timestamp = require_timestamp(payload, "timestamp", kind)?;
    let flow = payload
        .get("flow")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed(kind, "missing flow object"))?;

    let unit = flow.get("unit").and_then(Value::as_str).unwrap_or("kmh");
    let to_kmh = match unit.to_ascii_lowercase().as_str() {
        "kmh" => 1.0,
        "mph" => MPH_TO_KMH,
        other => return Err(malformed(kind, format!("unknown speed unit {other:?}"))),
    };

    let speed = require_f64(flow, "current_speed", kind)? * to_kmh;
    let free_flow = require_f64(flow, "free_flow_speed", kind)? * to_kmh;
    if speed < 0.0 || free_flow < 0.0 {
        return Err(malformed(kind, "negative speed"));
    }

    let mut quality = Quality::Measured;
    if let Some(confidence) = flow.get("confidence") {
        let confidence = confidence
            .as_f64()
            .ok_or_else(|| malformed(kind, "confidence is not a number"))?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(malformed(
                kind,
                format!("confidence {confidence} outside [0, 1]"),
            ));
        }
        if confidence < CONFIDENCE_FLOOR {
            quality = Quality::Estimated;
        }
    }

    let mut value_map = BTreeMap::new();
    value_map.insert(metric::SPEED_KMH.to_string(), speed);
    value_map.insert(metric::FREE_FLOW_KMH.to_string(), free_flow);

    Ok(NormalizedRecord {
        source_kind: kind,
        entity_id,
        timestamp,
        value_map,
        quality,
    })
}

/// Weather observation payload, v1 (Visual-Crossing shaped):
///
/// ```json
/// {
///   "station_id": "la-defense",
///   "observed_at": 1741000200,
///   "temp": {"value": 41.0, "unit": "f"},
///   "precip": {"value": 0.1, "unit": "in"},
///   "wind": {"value": 5.2, "unit": "ms"},
///   "humidity_pct": 81.0
/// }
/// ```
fn normalize_weather(payload: &Value) -> Result<NormalizedRecord, EngineError> {
    let kind = SourceKind::Weather;
    let entity_id = require_str(payload, "station_id", kind)?;
    let timestamp = require_timestamp(payload, "observed_at", kind)?;

    let mut value_map = BTreeMap::new();

    let (temp, temp_unit) = require_measure(payload, "temp", "c", kind)?;
    let temp_c = match temp_unit.as_str() {
        "c" => temp,
        "f" => (temp - 32.0) * 5.0 / 9.0,
        other => {
            return Err(malformed(
                kind,
                format!("unknown temperature unit {other:?}"),
            ));
        }
    };
    value_map.insert(metric::TEMP_C.to_string(), temp_c);

    if let Some((precip, unit)) = optional_measure(payload, "precip", "mm", kind)? {
        let precip_mm = match unit.as_str() {
            "mm" => precip,
            "in" => precip * IN_TO_MM,
            other => {
                return Err(malformed(
                    kind,
                    format!("unknown precipitation unit {other:?}"),
                ));
            }
        };
        if precip_mm < 0.0 {
            return Err(malformed(kind, "negative precipitation"));
        }
        value_map.insert(metric::PRECIP_MM.to_string(), precip_mm);
    }

    if let Some((wind, unit)) = optional_measure(payload, "wind", "kmh", kind)? {
        let wind_kmh = match unit.as_str() {
            "kmh" => wind,
            "ms" => wind * MS_TO_KMH,
            "mph" => wind * MPH_TO_KMH,
            other => return Err(malformed(kind, format!("unknown wind unit {other:?}"))),
        };
        if wind_kmh < 0.0 {
            return Err(malformed(kind, "negative wind speed"));
        }
        value_map.insert(metric::WIND_KMH.to_string(), wind_kmh);
    }

    if let Some(humidity) = payload.get("humidity_pct") {
        let humidity = humidity
            .as_f64()
            .ok_or_else(|| malformed(kind, "humidity_pct is not a number"))?;
        if !(0.0..=100.0).contains(&humidity) {
            return Err(malformed(
                kind,
                format!("humidity_pct {humidity} outside [0, 100]"),
            ));
        }
        value_map.insert(metric::HUMIDITY_PCT.to_string(), humidity);
    }

    let quality = if payload.get("estimated").and_then(Value::as_bool) == Some(true) {
        Quality::Estimated
    } else {
        Quality::Measured
    };

    Ok(NormalizedRecord {
        source_kind: kind,
        entity_id,
        timestamp,
        value_map,
        quality,
    })
}

/// Transit delay payload, v1 (IDFM/SNCF shaped):
///
/// ```json
/// {"stop_id": "esplanade", "recorded_at": "2025-03-03T08:01:30Z",
///  "delay": {"value": 2.0, "unit": "min"}, "line": "M1"}
/// ```
///
/// Negative delays (early running) are valid.
fn normalize_transit(payload: &Value) -> Result<NormalizedRecord, EngineError> {
    let kind = SourceKind::Transit;
    let entity_id = require_str(payload, "stop_id", kind)?;
    let timestamp = require_timestamp(payload, "recorded_at", kind)?;

    let (delay, unit) = require_measure(payload, "delay", "s", kind)?;
    let delay_s = match unit.as_str() {
        "s" => delay,
        "min" => delay * 60.0,
        other => return Err(malformed(kind, format!("unknown delay unit {other:?}"))),
    };

    let mut value_map = BTreeMap::new();
    value_map.insert(metric::DELAY_S.to_string(), delay_s);

    Ok(NormalizedRecord {
        source_kind: kind,
        entity_id,
        timestamp,
        value_map,
        quality: Quality::Measured,
    })
}

fn malformed(kind: SourceKind, reason: impl Into<String>) -> EngineError {
    EngineError::MalformedSourceData {
        kind,
        reason: reason.into(),
    }
}

fn require_str(payload: &Value, field: &str, kind: SourceKind) -> Result<String, EngineError> {
    let s = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(kind, format!("missing field {field:?}")))?;
    if s.is_empty() {
        return Err(malformed(kind, format!("empty field {field:?}")));
    }
    Ok(s.to_string())
}

fn require_f64(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    kind: SourceKind,
) -> Result<f64, EngineError> {
    let v = obj
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| malformed(kind, format!("missing numeric field {field:?}")))?;
    if !v.is_finite() {
        return Err(malformed(kind, format!("non-finite value for {field:?}")));
    }
    Ok(v)
}

/// Reads a `{value, unit}` measure object; `unit` defaults to `default_unit`.
fn require_measure(
    payload: &Value,
    field: &str,
    default_unit: &str,
    kind: SourceKind,
) -> Result<(f64, String), EngineError> {
    optional_measure(payload, field, default_unit, kind)?
        .ok_or_else(|| malformed(kind, format!("missing field {field:?}")))
}

fn optional_measure(
    payload: &Value,
    field: &str,
    default_unit: &str,
    kind: SourceKind,
) -> Result<Option<(f64, String)>, EngineError> {
    let Some(obj) = payload.get(field) else {
        return Ok(None);
    };
    let obj = obj
        .as_object()
        .ok_or_else(|| malformed(kind, format!("{field:?} is not an object")))?;
    let value = require_f64(obj, "value", kind)?;
    let unit = obj
        .get("unit")
        .and_then(Value::as_str)
        .unwrap_or(default_unit)
        .to_ascii_lowercase();
    Ok(Some((value, unit)))
}

/// Parses RFC 3339 strings or integer epoch seconds, truncated to second
/// precision.
fn require_timestamp(
    payload: &Value,
    field: &str,
    kind: SourceKind,
) -> Result<DateTime<Utc>, EngineError> {
    let raw = payload
        .get(field)
        .ok_or_else(|| malformed(kind, format!("missing field {field:?}")))?;

    let parsed = match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    };

    parsed
        .and_then(|dt| DateTime::from_timestamp(dt.timestamp(), 0))
        .ok_or_else(|| malformed(kind, format!("unparseable timestamp in {field:?}: {raw}")))
}
