//! Error taxonomy for the fusion engine.
//!
//! Every failure a caller can observe maps onto one of these variants.
//! Recoverable conditions (stale data, missing model) are handled close to
//! where they occur; only genuinely unresolvable states propagate.

use crate::types::SourceKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Raw payload rejected at normalization. The ingest path logs and drops
    /// these; an ingestion stream never aborts because of one bad payload.
    #[error("malformed {kind} payload: {reason}")]
    MalformedSourceData { kind: SourceKind, reason: String },

    /// No timeline exists for the requested `(entity, source_kind)` pair.
    #[error("no {kind} timeline for entity {entity_id}")]
    UnknownEntity { entity_id: String, kind: SourceKind },

    /// The route catalog has no candidates for the requested pair.
    #[error("no candidate routes between {origin} and {destination}")]
    UnknownRoutePair { origin: String, destination: String },

    /// The nearest usable record is too old for the query. `age_s` is
    /// negative when the timeline only begins after the query time.
    #[error("{kind} data for {entity_id} is stale: age {age_s}s exceeds {max_staleness_s}s")]
    StaleData {
        entity_id: String,
        kind: SourceKind,
        age_s: i64,
        max_staleness_s: i64,
    },

    /// Feature construction cannot proceed and no fallback is configured.
    #[error("insufficient data for {scope}: no value for {missing}")]
    InsufficientData { scope: String, missing: String },

    /// No fitted model artifact is loaded.
    #[error("no model artifact loaded: {0}")]
    ModelUnavailable(String),

    /// Feature schema of a model artifact or forecast does not match the
    /// consumer's expectation. Never silently coerced.
    #[error("feature schema mismatch: expected v{expected}, found v{found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}
