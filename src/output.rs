//! Output formatting and persistence for issued forecasts.
//!
//! Supports JSON printing for the presentation hand-off and CSV append for
//! the back-office collection of issued forecasts.

use crate::error::EngineError;
use crate::forecast::ForecastResult;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::debug;

/// One CSV row per forecast horizon.
#[derive(Debug, Serialize)]
struct ForecastCsvRow<'a> {
    segment_id: &'a str,
    issued_at: DateTime<Utc>,
    horizon_bucket: usize,
    congestion_index: f64,
    level: &'a str,
    interval_lower: f64,
    interval_upper: f64,
    schema_version: u32,
    model_version: u32,
    degraded: bool,
}

/// Prints a value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), EngineError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends a forecast's horizons as rows to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_forecast(path: &Path, forecast: &ForecastResult) -> Result<(), EngineError> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending forecast CSV rows");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for horizon in &forecast.horizons {
        writer.serialize(ForecastCsvRow {
            segment_id: &forecast.segment_id,
            issued_at: forecast.issued_at,
            horizon_bucket: horizon.horizon_bucket,
            congestion_index: horizon.congestion_index,
            level: horizon.level.as_str(),
            interval_lower: horizon.interval.lower,
            interval_upper: horizon.interval.upper,
            schema_version: forecast.schema_version,
            model_version: forecast.model_version,
            degraded: forecast.degraded,
        })?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_SCHEMA_VERSION;
    use crate::forecast::{ConfidenceInterval, CongestionLevel, HorizonPrediction};
    use std::fs;

    fn forecast(horizons: usize) -> ForecastResult {
        ForecastResult {
            segment_id: "S1".to_string(),
            issued_at: Utc::now(),
            schema_version: FEATURE_SCHEMA_VERSION,
            model_version: 1,
            degraded: false,
            horizons: (1..=horizons)
                .map(|k| HorizonPrediction {
                    horizon_bucket: k,
                    congestion_index: 0.4,
                    level: CongestionLevel::Moderate,
                    interval: ConfidenceInterval {
                        lower: 0.3,
                        upper: 0.5,
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn test_append_forecast_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecasts.csv");

        append_forecast(&path, &forecast(2)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("segment_id,"));
        // 1 header + 2 horizon rows
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_append_forecast_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecasts.csv");

        append_forecast(&path, &forecast(2)).unwrap();
        append_forecast(&path, &forecast(2)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content
            .lines()
            .filter(|l| l.starts_with("segment_id,"))
            .count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 5);
    }

    #[test]
    fn test_rows_carry_level_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecasts.csv");

        append_forecast(&path, &forecast(1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(",moderate,"));
    }
}
