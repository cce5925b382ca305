//! Historical profile store.
//!
//! Rolling per-segment statistics of every canonical metric, keyed by
//! (entity, source kind, metric, day-of-week, hour-of-day), plus an overall
//! per-metric aggregate used when a specific slot has never been observed.
//! Profiles feed the feature builder's gap-fill step and the degraded
//! baseline forecast. They are updated on every newly inserted record, so
//! training replay and live serving see identical state.

use crate::types::{NormalizedRecord, SourceKind, metric};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Day-of-week (Monday = 0) and hour-of-day for a timestamp; the slot
/// coordinates used across profiles and feature derivation.
pub fn slot_of(at: DateTime<Utc>) -> (u8, u8) {
    (at.weekday().num_days_from_monday() as u8, at.hour() as u8)
}

/// Streaming mean/variance accumulator (Welford).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn observe(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Population standard deviation; 0 until two observations exist.
    pub fn std(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct SlotKey {
    entity_id: String,
    source_kind: SourceKind,
    metric: String,
    /// `None` marks the overall (all-slots) aggregate.
    dow_hour: Option<(u8, u8)>,
}

/// One persisted profile slot, flattened for the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSlot {
    pub entity_id: String,
    pub source_kind: SourceKind,
    pub metric: String,
    pub dow_hour: Option<(u8, u8)>,
    pub stats: RunningStats,
}

/// Summary returned by lookups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotSummary {
    pub count: u64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Default)]
pub struct ProfileStore {
    slots: RwLock<HashMap<SlotKey, RunningStats>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one accepted record into its (dow, hour) slot and the overall
    /// aggregate. Traffic records additionally contribute their derived
    /// congestion index.
    pub fn observe(&self, record: &NormalizedRecord) {
        let dow_hour = slot_of(record.timestamp);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        let mut fold = |metric_name: &str, value: f64| {
            for dow_hour in [Some(dow_hour), None] {
                let key = SlotKey {
                    entity_id: record.entity_id.clone(),
                    source_kind: record.source_kind,
                    metric: metric_name.to_string(),
                    dow_hour,
                };
                slots.entry(key).or_default().observe(value);
            }
        };

        for (name, value) in &record.value_map {
            fold(name, *value);
        }
        if let Some(congestion) = record.congestion_index() {
            fold(metric::CONGESTION, congestion);
        }
    }

    /// Looks up the (dow, hour) slot for `at_time`, falling back to the
    /// overall aggregate when that slot has never been observed.
    pub fn summary_at(
        &self,
        entity_id: &str,
        source_kind: SourceKind,
        metric: &str,
        at_time: DateTime<Utc>,
    ) -> Option<SlotSummary> {
        let dow_hour = slot_of(at_time);
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);

        for dow_hour in [Some(dow_hour), None] {
            let key = SlotKey {
                entity_id: entity_id.to_string(),
                source_kind,
                metric: metric.to_string(),
                dow_hour,
            };
            if let Some(stats) = slots.get(&key)
                && stats.count > 0
            {
                return Some(SlotSummary {
                    count: stats.count,
                    mean: stats.mean,
                    std: stats.std(),
                });
            }
        }
        None
    }

    pub fn snapshot(&self) -> Vec<ProfileSlot> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut flat: Vec<ProfileSlot> = slots
            .iter()
            .map(|(key, stats)| ProfileSlot {
                entity_id: key.entity_id.clone(),
                source_kind: key.source_kind,
                metric: key.metric.clone(),
                dow_hour: key.dow_hour,
                stats: *stats,
            })
            .collect();
        flat.sort_by(|a, b| {
            (
                a.source_kind.as_str(),
                &a.entity_id,
                &a.metric,
                a.dow_hour,
            )
                .cmp(&(b.source_kind.as_str(), &b.entity_id, &b.metric, b.dow_hour))
        });
        flat
    }

    pub fn restore(&self, flat: Vec<ProfileSlot>) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.clear();
        for slot in flat {
            slots.insert(
                SlotKey {
                    entity_id: slot.entity_id,
                    source_kind: slot.source_kind,
                    metric: slot.metric,
                    dow_hour: slot.dow_hour,
                },
                slot.stats,
            );
        }
    }
}
