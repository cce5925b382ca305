//! Segment timeline store.
//!
//! Append-only per-entity time series of normalized records, with aligned
//! value lookups for arbitrary query timestamps. The store is shared between
//! ingestion and forecasting: the outer map is behind one `RwLock`, each
//! timeline behind its own, so appends to unrelated entities proceed in
//! parallel and readers never observe a half-applied append.

use crate::error::EngineError;
use crate::types::{NormalizedRecord, SourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimelineKey {
    pub entity_id: String,
    pub source_kind: SourceKind,
}

/// Outcome of one append, for ingest accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Same timestamp, strictly better quality: the old record was replaced.
    Upgraded,
    /// Same timestamp, equal or worse quality: the append was a no-op.
    IgnoredDuplicate,
}

/// Ordered records for one `(entity_id, source_kind)` pair, strictly
/// increasing by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentTimeline {
    pub entity_id: String,
    pub source_kind: SourceKind,
    records: Vec<NormalizedRecord>,
}

impl SegmentTimeline {
    fn new(entity_id: String, source_kind: SourceKind) -> Self {
        Self {
            entity_id,
            source_kind,
            records: Vec::new(),
        }
    }

    fn append(&mut self, record: NormalizedRecord) -> AppendOutcome {
        let idx = self
            .records
            .partition_point(|r| r.timestamp < record.timestamp);
        if let Some(existing) = self.records.get_mut(idx)
            && existing.timestamp == record.timestamp
        {
            if record.quality > existing.quality {
                *existing = record;
                return AppendOutcome::Upgraded;
            }
            return AppendOutcome::IgnoredDuplicate;
        }
        self.records.insert(idx, record);
        AppendOutcome::Inserted
    }

    fn prune(&mut self, retention_window_s: i64) {
        let Some(newest) = self.records.last() else {
            return;
        };
        let cutoff = newest.timestamp - chrono::Duration::seconds(retention_window_s);
        let keep_from = self.records.partition_point(|r| r.timestamp < cutoff);
        if keep_from > 0 {
            self.records.drain(..keep_from);
        }
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aligned lookup at `at_time`. The base is the last record at or before
    /// `at_time`; a later record within `max_staleness_s` of `at_time` turns
    /// the lookup into a linear interpolation between the bracketing pair.
    /// Past the newest record the base is carried forward, never
    /// extrapolated.
    fn query(
        &self,
        at_time: DateTime<Utc>,
        max_staleness_s: i64,
    ) -> Result<BTreeMap<String, f64>, EngineError> {
        let idx = self.records.partition_point(|r| r.timestamp <= at_time);
        let Some(prev) = idx.checked_sub(1).and_then(|i| self.records.get(i)) else {
            // Timeline starts after the query time; negative age by
            // convention.
            let first = self.records.first().ok_or_else(|| {
                EngineError::UnknownEntity {
                    entity_id: self.entity_id.clone(),
                    kind: self.source_kind,
                }
            })?;
            return Err(EngineError::StaleData {
                entity_id: self.entity_id.clone(),
                kind: self.source_kind,
                age_s: (at_time - first.timestamp).num_seconds(),
                max_staleness_s,
            });
        };

        let age_s = (at_time - prev.timestamp).num_seconds();
        if age_s > max_staleness_s {
            return Err(EngineError::StaleData {
                entity_id: self.entity_id.clone(),
                kind: self.source_kind,
                age_s,
                max_staleness_s,
            });
        }

        let mut values = prev.value_map.clone();
        if let Some(next) = self.records.get(idx)
            && (next.timestamp - at_time).num_seconds() <= max_staleness_s
        {
            let span = (next.timestamp - prev.timestamp).num_seconds();
            if span > 0 {
                let factor = (at_time - prev.timestamp).num_seconds() as f64 / span as f64;
                for (name, base) in values.iter_mut() {
                    // Metrics absent from the later record keep the base
                    // value.
                    if let Some(later) = next.value_map.get(name) {
                        *base += (later - *base) * factor;
                    }
                }
            }
        }
        Ok(values)
    }
}

/// Shared store of all timelines.
#[derive(Debug)]
pub struct TimelineStore {
    timelines: RwLock<HashMap<TimelineKey, Arc<RwLock<SegmentTimeline>>>>,
    retention_window_s: i64,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl TimelineStore {
    pub fn new(retention_window_s: i64) -> Self {
        Self {
            timelines: RwLock::new(HashMap::new()),
            retention_window_s,
        }
    }

    fn timeline(&self, key: &TimelineKey) -> Option<Arc<RwLock<SegmentTimeline>>> {
        read_lock(&self.timelines).get(key).cloned()
    }

    fn timeline_or_insert(&self, key: TimelineKey) -> Arc<RwLock<SegmentTimeline>> {
        if let Some(tl) = self.timeline(&key) {
            return tl;
        }
        let mut map = write_lock(&self.timelines);
        map.entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(SegmentTimeline::new(
                    key.entity_id,
                    key.source_kind,
                )))
            })
            .clone()
    }

    /// Appends one record, deduplicating by timestamp and pruning records
    /// that fell out of the retention window.
    pub fn append(&self, record: NormalizedRecord) -> AppendOutcome {
        let key = TimelineKey {
            entity_id: record.entity_id.clone(),
            source_kind: record.source_kind,
        };
        let timeline = self.timeline_or_insert(key);
        let mut tl = write_lock(&timeline);
        let outcome = tl.append(record);
        if outcome != AppendOutcome::IgnoredDuplicate {
            tl.prune(self.retention_window_s);
        }
        outcome
    }

    /// Aligned value lookup, see [`SegmentTimeline::query`] for the
    /// interpolation and carry-forward rules.
    pub fn query(
        &self,
        entity_id: &str,
        source_kind: SourceKind,
        at_time: DateTime<Utc>,
        max_staleness_s: i64,
    ) -> Result<BTreeMap<String, f64>, EngineError> {
        let key = TimelineKey {
            entity_id: entity_id.to_string(),
            source_kind,
        };
        let timeline = self
            .timeline(&key)
            .ok_or_else(|| EngineError::UnknownEntity {
                entity_id: entity_id.to_string(),
                kind: source_kind,
            })?;
        let tl = read_lock(&timeline);
        if tl.is_empty() {
            return Err(EngineError::UnknownEntity {
                entity_id: entity_id.to_string(),
                kind: source_kind,
            });
        }
        tl.query(at_time, max_staleness_s)
    }

    pub fn latest_timestamp(
        &self,
        entity_id: &str,
        source_kind: SourceKind,
    ) -> Option<DateTime<Utc>> {
        let key = TimelineKey {
            entity_id: entity_id.to_string(),
            source_kind,
        };
        let timeline = self.timeline(&key)?;
        let tl = read_lock(&timeline);
        tl.records.last().map(|r| r.timestamp)
    }

    /// Oldest and newest record timestamps of one timeline.
    pub fn time_bounds(
        &self,
        entity_id: &str,
        source_kind: SourceKind,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let key = TimelineKey {
            entity_id: entity_id.to_string(),
            source_kind,
        };
        let timeline = self.timeline(&key)?;
        let tl = read_lock(&timeline);
        match (tl.records.first(), tl.records.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp)),
            _ => None,
        }
    }

    /// All entity ids with a timeline of the given kind, sorted.
    pub fn entity_ids(&self, source_kind: SourceKind) -> Vec<String> {
        let map = read_lock(&self.timelines);
        let mut ids: Vec<String> = map
            .keys()
            .filter(|k| k.source_kind == source_kind)
            .map(|k| k.entity_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn record_count(&self) -> usize {
        let map = read_lock(&self.timelines);
        map.values().map(|tl| read_lock(tl).len()).sum()
    }

    /// Deep copy of every timeline, in deterministic order, for
    /// serialization.
    pub fn snapshot(&self) -> Vec<SegmentTimeline> {
        let map = read_lock(&self.timelines);
        let mut timelines: Vec<SegmentTimeline> =
            map.values().map(|tl| read_lock(tl).clone()).collect();
        timelines.sort_by(|a, b| {
            (a.source_kind.as_str(), &a.entity_id).cmp(&(b.source_kind.as_str(), &b.entity_id))
        });
        timelines
    }

    /// Replaces the store contents with a previously snapshotted state.
    pub fn restore(&self, timelines: Vec<SegmentTimeline>) {
        let mut map = write_lock(&self.timelines);
        map.clear();
        for tl in timelines {
            let key = TimelineKey {
                entity_id: tl.entity_id.clone(),
                source_kind: tl.source_kind,
            };
            map.insert(key, Arc::new(RwLock::new(tl)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quality, metric};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn traffic_record(entity: &str, secs: i64, speed: f64, quality: Quality) -> NormalizedRecord {
        let mut value_map = BTreeMap::new();
        value_map.insert(metric::SPEED_KMH.to_string(), speed);
        value_map.insert(metric::FREE_FLOW_KMH.to_string(), 50.0);
        NormalizedRecord {
            source_kind: SourceKind::Traffic,
            entity_id: entity.to_string(),
            timestamp: ts(secs),
            value_map,
            quality,
        }
    }

    fn store() -> TimelineStore {
        TimelineStore::new(7 * 24 * 3600)
    }

    #[test]
    fn test_out_of_order_appends_yield_sorted_timeline() {
        let store = store();
        for secs in [30, 10, 20, 50, 40] {
            let outcome = store.append(traffic_record("S1", secs, 30.0, Quality::Measured));
            assert_eq!(outcome, AppendOutcome::Inserted);
        }
        let snapshot = store.snapshot();
        let times: Vec<i64> = snapshot[0]
            .records()
            .iter()
            .map(|r| r.timestamp.timestamp())
            .collect();
        assert_eq!(times, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_duplicate_timestamp_upgrades_only_on_better_quality() {
        let store = store();
        store.append(traffic_record("S1", 10, 30.0, Quality::Estimated));

        // worse: ignored
        let outcome = store.append(traffic_record("S1", 10, 99.0, Quality::Stale));
        assert_eq!(outcome, AppendOutcome::IgnoredDuplicate);
        // equal: ignored
        let outcome = store.append(traffic_record("S1", 10, 99.0, Quality::Estimated));
        assert_eq!(outcome, AppendOutcome::IgnoredDuplicate);
        // better: replaces
        let outcome = store.append(traffic_record("S1", 10, 25.0, Quality::Measured));
        assert_eq!(outcome, AppendOutcome::Upgraded);

        let values = store.query("S1", SourceKind::Traffic, ts(10), 600).unwrap();
        assert_eq!(values[metric::SPEED_KMH], 25.0);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_query_interpolates_between_bracketing_records() {
        let store = store();
        store.append(traffic_record("S1", 10, 40.0, Quality::Measured));
        store.append(traffic_record("S1", 20, 20.0, Quality::Measured));

        let values = store.query("S1", SourceKind::Traffic, ts(15), 10).unwrap();
        assert_eq!(values[metric::SPEED_KMH], 30.0);
        assert_eq!(values[metric::FREE_FLOW_KMH], 50.0);
    }

    #[test]
    fn test_query_carries_forward_past_newest_record() {
        let store = store();
        store.append(traffic_record("S1", 10, 40.0, Quality::Measured));
        store.append(traffic_record("S1", 20, 20.0, Quality::Measured));

        // No extrapolation of the 40 -> 20 trend.
        let values = store.query("S1", SourceKind::Traffic, ts(25), 600).unwrap();
        assert_eq!(values[metric::SPEED_KMH], 20.0);
    }

    #[test]
    fn test_query_never_uses_later_record_as_base() {
        let store = store();
        store.append(traffic_record("S1", 100, 40.0, Quality::Measured));
        let err = store
            .query("S1", SourceKind::Traffic, ts(50), 600)
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleData { age_s: -50, .. }));
    }

    #[test]
    fn test_query_stale_base_fails() {
        let store = store();
        store.append(traffic_record("S1", 10, 40.0, Quality::Measured));
        let err = store
            .query("S1", SourceKind::Traffic, ts(700), 600)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleData {
                age_s: 690,
                max_staleness_s: 600,
                ..
            }
        ));
    }

    #[test]
    fn test_query_unknown_entity_fails() {
        let store = store();
        store.append(traffic_record("S1", 10, 40.0, Quality::Measured));
        let err = store
            .query("S2", SourceKind::Traffic, ts(10), 600)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntity { .. }));
        // same entity id, different kind, is still unknown
        let err = store
            .query("S1", SourceKind::Weather, ts(10), 600)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntity { .. }));
    }

    #[test]
    fn test_interpolation_requires_next_within_staleness() {
        let store = store();
        store.append(traffic_record("S1", 10, 40.0, Quality::Measured));
        store.append(traffic_record("S1", 1000, 20.0, Quality::Measured));

        // Next record is 985s ahead of the query, staleness 600: base is
        // carried, not interpolated.
        let values = store.query("S1", SourceKind::Traffic, ts(15), 600).unwrap();
        assert_eq!(values[metric::SPEED_KMH], 40.0);
    }

    #[test]
    fn test_retention_prunes_old_records_on_append() {
        let store = TimelineStore::new(100);
        store.append(traffic_record("S1", 0, 40.0, Quality::Measured));
        store.append(traffic_record("S1", 50, 35.0, Quality::Measured));
        store.append(traffic_record("S1", 200, 30.0, Quality::Measured));

        let snapshot = store.snapshot();
        let times: Vec<i64> = snapshot[0]
            .records()
            .iter()
            .map(|r| r.timestamp.timestamp())
            .collect();
        // 0 and 50 are more than 100s behind 200
        assert_eq!(times, vec![200]);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let store = store();
        store.append(traffic_record("S1", 10, 40.0, Quality::Measured));
        store.append(traffic_record("S2", 20, 30.0, Quality::Measured));

        let restored = TimelineStore::new(7 * 24 * 3600);
        restored.restore(store.snapshot());

        assert_eq!(restored.record_count(), 2);
        let values = restored
            .query("S2", SourceKind::Traffic, ts(20), 600)
            .unwrap();
        assert_eq!(values[metric::SPEED_KMH], 30.0);
    }

    #[test]
    fn test_concurrent_appends_and_reads_stay_consistent() {
        let store = Arc::new(TimelineStore::new(7 * 24 * 3600));
        let mut handles = Vec::new();

        for worker in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let entity = format!("S{}", worker % 2);
                    let secs = (worker * 1000 + i * 10) as i64;
                    store.append(traffic_record(&entity, secs, 30.0, Quality::Measured));
                    // Reads interleave with writes; a successful read always
                    // sees a full record.
                    if let Ok(values) =
                        store.query(&entity, SourceKind::Traffic, ts(secs), i64::MAX / 4)
                    {
                        assert!(values.contains_key(metric::SPEED_KMH));
                        assert!(values.contains_key(metric::FREE_FLOW_KMH));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.record_count(), 200);
        for timeline in store.snapshot() {
            let records = timeline.records();
            for pair in records.windows(2) {
                assert!(pair[0].timestamp < pair[1].timestamp);
            }
        }
    }
}
