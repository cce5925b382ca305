//! Replay ingestion.
//!
//! The polling collectors are external; the engine consumes their recorded
//! output through the [`RecordSource`] seam. [`FileReplaySource`] reads the
//! handed-off format: JSON Lines envelopes, optionally gzip-compressed.
//! Replaying a recording reproduces the exact store and profile state the
//! live run would have built.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::timeline::AppendOutcome;
use crate::types::SourceKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use tracing::warn;

/// One raw-payload envelope as recorded by a collector.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordEnvelope {
    pub source_kind: SourceKind,
    /// Collector wall-clock time; replay time stands in when absent.
    pub received_at: Option<DateTime<Utc>>,
    pub payload: Value,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_envelopes(&self) -> Result<Vec<RecordEnvelope>, EngineError>;
}

/// JSON Lines file of envelopes; `.gz` paths are gzip-decoded. Lines that
/// do not parse as envelopes are logged and skipped, never fatal.
pub struct FileReplaySource {
    path: PathBuf,
}

impl FileReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for FileReplaySource {
    async fn fetch_envelopes(&self) -> Result<Vec<RecordEnvelope>, EngineError> {
        let raw = std::fs::read(&self.path)?;
        let text = if self.path.extension().and_then(|e| e.to_str()) == Some("gz") {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut out = String::new();
            decoder.read_to_string(&mut out)?;
            out
        } else {
            String::from_utf8(raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        };

        let mut envelopes = Vec::new();
        let mut skipped = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecordEnvelope>(line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => {
                    skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %err,
                        "Skipping unparseable envelope line"
                    );
                }
            }
        }
        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "Replay file had unparseable lines");
        }
        Ok(envelopes)
    }
}

/// Ingest accounting for one replayed source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub appended: usize,
    pub upgraded: usize,
    pub ignored_duplicates: usize,
    /// Envelopes whose payload the normalizer rejected.
    pub malformed: usize,
}

/// Feeds every envelope from `source` into the engine. Malformed payloads
/// are dropped and counted; anything else propagates.
pub async fn replay_into(
    engine: &Engine,
    source: &dyn RecordSource,
) -> Result<ReplayStats, EngineError> {
    let envelopes = source.fetch_envelopes().await?;
    let mut stats = ReplayStats::default();
    for envelope in envelopes {
        let received_at = envelope.received_at.unwrap_or_else(Utc::now);
        match engine.ingest(envelope.source_kind, &envelope.payload, received_at) {
            Ok(AppendOutcome::Inserted) => stats.appended += 1,
            Ok(AppendOutcome::Upgraded) => stats.upgraded += 1,
            Ok(AppendOutcome::IgnoredDuplicate) => stats.ignored_duplicates += 1,
            Err(EngineError::MalformedSourceData { kind, reason }) => {
                stats.malformed += 1;
                warn!(kind = %kind, reason, "Dropping malformed source record");
            }
            Err(other) => return Err(other),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn lines() -> String {
        [
            r#"{"source_kind": "traffic", "received_at": "2025-03-03T08:00:10Z", "payload": {"segment_id": "S1", "timestamp": "2025-03-03T08:00:00Z", "flow": {"current_speed": 40.0, "free_flow_speed": 50.0}}}"#,
            // same timestamp again: ignored duplicate
            r#"{"source_kind": "traffic", "received_at": "2025-03-03T08:00:40Z", "payload": {"segment_id": "S1", "timestamp": "2025-03-03T08:00:00Z", "flow": {"current_speed": 40.0, "free_flow_speed": 50.0}}}"#,
            // payload missing the flow object: malformed
            r#"{"source_kind": "traffic", "received_at": "2025-03-03T08:05:10Z", "payload": {"segment_id": "S1", "timestamp": "2025-03-03T08:05:00Z"}}"#,
            // not an envelope at all: skipped at the file layer
            "bogus line",
            r#"{"source_kind": "weather", "received_at": "2025-03-03T08:00:20Z", "payload": {"station_id": "la-defense", "observed_at": "2025-03-03T08:00:00Z", "temp": {"value": 6.0}}}"#,
        ]
        .join("\n")
    }

    #[tokio::test]
    async fn test_replay_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        std::fs::write(&path, lines()).unwrap();

        let engine = Engine::new(EngineConfig::default());
        let source = FileReplaySource::new(&path);
        let stats = replay_into(&engine, &source).await.unwrap();

        assert_eq!(stats.appended, 2);
        assert_eq!(stats.ignored_duplicates, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.upgraded, 0);
        assert_eq!(engine.record_count(), 2);
    }

    #[tokio::test]
    async fn test_replay_reads_gzip_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(lines().as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let engine = Engine::new(EngineConfig::default());
        let stats = replay_into(&engine, &FileReplaySource::new(&path))
            .await
            .unwrap();
        assert_eq!(stats.appended, 2);
        assert_eq!(engine.record_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let engine = Engine::new(EngineConfig::default());
        let source = FileReplaySource::new("/nonexistent/records.jsonl");
        assert!(matches!(
            replay_into(&engine, &source).await,
            Err(EngineError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_envelope_without_received_at_uses_replay_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        // Past timestamp, no received_at: replay wall-clock passes the skew
        // check.
        std::fs::write(
            &path,
            r#"{"source_kind": "transit", "payload": {"stop_id": "esplanade", "recorded_at": "2025-03-03T08:00:00Z", "delay": {"value": 1.0, "unit": "min"}}}"#,
        )
        .unwrap();

        let engine = Engine::new(EngineConfig::default());
        let stats = replay_into(&engine, &FileReplaySource::new(&path))
            .await
            .unwrap();
        assert_eq!(stats.appended, 1);
    }
}
