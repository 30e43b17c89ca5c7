//! Weekly series persistence.
//!
//! One document per (target kind, target id) holds a map of ISO week start
//! to [`WeekBucket`]. Additive fields are written with blind atomic
//! increments in chunked batches, so concurrent workouts commute. Extremal
//! fields need a read-modify-write transaction and are only ever extended:
//! a retraction cannot lower a max without rescanning the bucket's facts,
//! which is what [`SeriesStore::replace_bucket`] (reconciliation) is for.

use crate::delta::{DeltaRecord, Deltas, RepsBuckets};
use crate::store::{field_get, number, path, DocRef, DocumentStore, TxOutcome, WriteOp};
use crate::week::{parse_week_key, week_key};
use crate::{Error, Result, SeriesKey, TargetKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const SERIES_COLLECTION: &str = "weekly_series";

/// Document id of a target's series
pub fn series_doc_id(key: &SeriesKey) -> String {
    format!("{}__{}", key.kind.as_str(), key.id)
}

pub fn series_doc(key: &SeriesKey) -> DocRef {
    DocRef::new(SERIES_COLLECTION, series_doc_id(key))
}

/// One week of one series
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct WeekBucket {
    #[serde(default)]
    pub sets: f64,
    #[serde(default)]
    pub hard_sets: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub effective_volume: f64,
    #[serde(default)]
    pub rir_sum: f64,
    #[serde(default)]
    pub rir_count: f64,
    #[serde(default)]
    pub failure_sets: f64,
    #[serde(default)]
    pub set_count: f64,
    #[serde(default)]
    pub reps_bucket: RepsBuckets,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e1rm_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rir_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rir_max: Option<f64>,
}

impl From<&DeltaRecord> for WeekBucket {
    fn from(record: &DeltaRecord) -> Self {
        WeekBucket {
            sets: record.sets,
            hard_sets: record.hard_sets,
            volume: record.volume,
            effective_volume: record.effective_volume,
            rir_sum: record.rir_sum,
            rir_count: record.rir_count,
            failure_sets: record.failure_sets,
            set_count: record.set_count,
            reps_bucket: record.reps_bucket.clone(),
            e1rm_max: record.e1rm_max,
            load_min: record.load_min,
            load_max: record.load_max,
            rir_min: record.rir_min,
            rir_max: record.rir_max,
        }
    }
}

/// A target's full weekly series document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeeklySeries {
    pub target_kind: TargetKind,
    pub target_id: String,
    #[serde(default)]
    pub exercise_name: Option<String>,
    /// Keyed by week start (`YYYY-MM-DD`)
    #[serde(default)]
    pub weeks: BTreeMap<String, WeekBucket>,
}

impl WeeklySeries {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.target_kind, self.target_id.clone())
    }

    /// Buckets within [from, to], oldest first; malformed keys are skipped
    pub fn buckets_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, &WeekBucket)> {
        self.weeks
            .iter()
            .filter_map(|(key, bucket)| match parse_week_key(key) {
                Ok(week) => Some((week, bucket)),
                Err(e) => {
                    tracing::warn!("Ignoring bucket '{}' of {}: {}", key, self.key(), e);
                    None
                }
            })
            .filter(|(week, _)| *week >= from && *week <= to)
            .collect()
    }
}

/// Read-side projection of one bucket
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeekPoint {
    pub week_start: NaiveDate,
    pub sets: f64,
    pub hard_sets: f64,
    pub volume: f64,
    pub effective_volume: f64,
    pub set_count: f64,
    pub e1rm_max: Option<f64>,
    pub load_min: Option<f64>,
    pub load_max: Option<f64>,
    pub avg_rir: Option<f64>,
    pub failure_rate: Option<f64>,
    pub reps_bucket: RepsBuckets,
}

impl WeekPoint {
    pub fn from_bucket(week_start: NaiveDate, bucket: &WeekBucket) -> Self {
        let avg_rir = (bucket.rir_count > 0.0).then(|| bucket.rir_sum / bucket.rir_count);
        let failure_rate = (bucket.sets > 0.0).then(|| bucket.failure_sets / bucket.sets);
        Self {
            week_start,
            sets: bucket.sets,
            hard_sets: bucket.hard_sets,
            volume: bucket.volume,
            effective_volume: bucket.effective_volume,
            set_count: bucket.set_count,
            e1rm_max: bucket.e1rm_max,
            load_min: bucket.load_min,
            load_max: bucket.load_max,
            avg_rir,
            failure_rate,
            reps_bucket: bucket.reps_bucket.clone(),
        }
    }

    /// A bucket fully retracted back to zero carries no data
    pub fn has_data(&self) -> bool {
        self.set_count > 0.0
    }

    /// Volume credited to a target: raw for exercises, attributed otherwise
    pub fn volume_for(&self, kind: TargetKind) -> f64 {
        match kind {
            TargetKind::Exercise => self.volume,
            TargetKind::MuscleGroup | TargetKind::Muscle => self.effective_volume,
        }
    }
}

/// Whether a delta is being added (workout completed) or removed (deleted)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sign {
    Apply,
    Retract,
}

impl Sign {
    pub fn factor(self) -> f64 {
        match self {
            Sign::Apply => 1.0,
            Sign::Retract => -1.0,
        }
    }
}

/// What one pass over the three series families did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub documents: usize,
    pub increments: usize,
    pub chunks: usize,
    pub extrema_updated: usize,
}

#[derive(Clone, Copy)]
enum Extreme {
    Max,
    Min,
}

const EXTREMAL_FIELDS: [(&str, Extreme); 5] = [
    ("e1rm_max", Extreme::Max),
    ("load_min", Extreme::Min),
    ("load_max", Extreme::Max),
    ("rir_min", Extreme::Min),
    ("rir_max", Extreme::Max),
];

fn extremal_value(record: &DeltaRecord, field: &str) -> Option<f64> {
    match field {
        "e1rm_max" => record.e1rm_max,
        "load_min" => record.load_min,
        "load_max" => record.load_max,
        "rir_min" => record.rir_min,
        "rir_max" => record.rir_max,
        _ => None,
    }
}

fn series_skeleton(key: &SeriesKey) -> Value {
    json!({
        "target_kind": key.kind,
        "target_id": key.id,
        "weeks": {},
    })
}

/// Extend the extrema of one bucket; returns whether anything changed
fn extend_extrema(doc: &mut Value, week: &str, record: &DeltaRecord) -> Result<bool> {
    let mut changed = false;
    for (field, extreme) in EXTREMAL_FIELDS {
        let Some(candidate) = extremal_value(record, field) else {
            continue;
        };
        let field_path = path(&["weeks", week, field]);
        let current = field_get(doc, &field_path).and_then(Value::as_f64);
        let extends = match (current, extreme) {
            (None, _) => true,
            (Some(c), Extreme::Max) => candidate > c,
            (Some(c), Extreme::Min) => candidate < c,
        };
        if extends {
            crate::store::field_set(doc, &field_path, number(candidate))?;
            changed = true;
        }
    }
    Ok(changed)
}

/// Writer for weekly series documents
pub struct SeriesStore<'a> {
    store: &'a dyn DocumentStore,
    chunk_size: usize,
}

impl<'a> SeriesStore<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            chunk_size: store.max_batch_ops(),
        }
    }

    /// Use smaller batches than the store allows
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, self.store.max_batch_ops());
        self
    }

    /// Apply or retract one workout's deltas across all three families
    pub fn apply(&self, deltas: &Deltas, sign: Sign) -> Result<ApplyStats> {
        let week = week_key(deltas.week_start);
        let factor = sign.factor();
        let mut ops = Vec::new();
        let mut stats = ApplyStats::default();

        for (key, record) in deltas.iter() {
            let doc = series_doc(&key);
            stats.documents += 1;
            ops.push(WriteOp::SetDefault {
                doc: doc.clone(),
                field: path(&["target_kind"]),
                value: json!(key.kind),
            });
            ops.push(WriteOp::SetDefault {
                doc: doc.clone(),
                field: path(&["target_id"]),
                value: json!(key.id),
            });
            if let Some(name) = &record.exercise_name {
                ops.push(WriteOp::SetDefault {
                    doc: doc.clone(),
                    field: path(&["exercise_name"]),
                    value: json!(name),
                });
            }
            for (field, amount) in record.additive_fields() {
                if amount == 0.0 {
                    continue;
                }
                let mut field_path = path(&["weeks", week.as_str()]);
                field_path.extend(field.iter().map(|s| s.to_string()));
                ops.push(WriteOp::Increment {
                    doc: doc.clone(),
                    field: field_path,
                    by: amount * factor,
                });
                stats.increments += 1;
            }
        }

        for (index, chunk) in ops.chunks(self.chunk_size).enumerate() {
            if let Err(e) = self.store.commit(chunk) {
                tracing::error!(
                    "Series write failed on chunk {} of {} for week {}: {}",
                    index + 1,
                    ops.len().div_ceil(self.chunk_size),
                    week,
                    e
                );
                return Err(Error::internal(format!(
                    "series write aborted after {} of {} chunks: {}",
                    index,
                    ops.len().div_ceil(self.chunk_size),
                    e
                )));
            }
            stats.chunks += 1;
        }

        if sign == Sign::Retract {
            tracing::debug!(
                "Skipping extrema on retract for week {}; reconcile to tighten them",
                week
            );
            return Ok(stats);
        }

        for (key, record) in deltas.iter().filter(|(_, r)| r.has_extrema()) {
            if self.extend_extrema(&key, &week, record)? {
                stats.extrema_updated += 1;
            }
        }

        tracing::debug!(
            "Applied {} increments in {} chunks over {} series for week {}",
            stats.increments,
            stats.chunks,
            stats.documents,
            week
        );
        Ok(stats)
    }

    fn extend_extrema(&self, key: &SeriesKey, week: &str, record: &DeltaRecord) -> Result<bool> {
        let mut changed = false;
        self.store.transact(&series_doc(key), &mut |current| {
            let mut doc = current.cloned().unwrap_or_else(|| series_skeleton(key));
            changed = extend_extrema(&mut doc, week, record)?;
            Ok(if changed {
                TxOutcome::Write(doc)
            } else {
                TxOutcome::Abort
            })
        })?;
        Ok(changed)
    }

    /// Overwrite one bucket wholesale (used by reconciliation)
    pub fn replace_bucket(
        &self,
        key: &SeriesKey,
        week_start: NaiveDate,
        bucket: &WeekBucket,
        exercise_name: Option<&str>,
    ) -> Result<()> {
        let week = week_key(week_start);
        let bucket_value = serde_json::to_value(bucket)?;
        self.store.transact(&series_doc(key), &mut |current| {
            let mut doc = current.cloned().unwrap_or_else(|| series_skeleton(key));
            crate::store::field_set(&mut doc, &path(&["weeks", week.as_str()]), bucket_value.clone())?;
            if let (Some(name), Some(obj)) = (exercise_name, doc.as_object_mut()) {
                obj.entry("exercise_name")
                    .or_insert_with(|| Value::String(name.to_string()));
            }
            Ok(TxOutcome::Write(doc))
        })
    }

    /// Load a target's series; `None` when it has never been written
    pub fn load(&self, key: &SeriesKey) -> Result<Option<WeeklySeries>> {
        let Some(value) = self.store.get(&series_doc(key))? else {
            return Ok(None);
        };
        let series: WeeklySeries = serde_json::from_value(value).map_err(|e| {
            Error::internal(format!("corrupt series document {}: {}", key, e))
        })?;
        Ok(Some(series))
    }

    /// Delete a target's whole series document
    pub fn purge(&self, key: &SeriesKey) -> Result<bool> {
        let mut existed = false;
        self.store.transact(&series_doc(key), &mut |current| {
            existed = current.is_some();
            Ok(if existed {
                TxOutcome::Delete
            } else {
                TxOutcome::Abort
            })
        })?;
        if existed {
            tracing::info!("Purged series {}", key);
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::aggregate;
    use crate::facts::generate_set_facts;
    use crate::store::MemoryStore;
    use crate::{catalog, ExerciseInput, SetInput, WeightUnit, WorkoutInput};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn workout(id: &str, sets: &[(u32, f64, i32)]) -> WorkoutInput {
        WorkoutInput {
            workout_id: id.into(),
            ended_at: Utc.with_ymd_and_hms(2024, 1, 17, 18, 0, 0).unwrap(),
            weight_unit: WeightUnit::Kg,
            exercises: vec![ExerciseInput {
                exercise_id: "bench_press".into(),
                name: None,
                weight_unit: None,
                sets: sets
                    .iter()
                    .map(|(reps, kg, rir)| SetInput {
                        reps: Some(*reps),
                        weight_kg: Some(*kg),
                        rir: Some(*rir),
                        ..Default::default()
                    })
                    .collect(),
            }],
        }
    }

    fn deltas(id: &str, sets: &[(u32, f64, i32)]) -> Deltas {
        let w = workout(id, sets);
        let facts = generate_set_facts(&w, catalog::get_default_catalog()).unwrap();
        aggregate(&facts, crate::week::week_start(w.ended_at))
    }

    fn bench() -> SeriesKey {
        SeriesKey::new(TargetKind::Exercise, "bench_press")
    }

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn test_apply_writes_all_families() {
        let store = MemoryStore::default();
        let series = SeriesStore::new(&store);
        let stats = series
            .apply(&deltas("w1", &[(8, 60.0, 2), (8, 60.0, 2), (8, 60.0, 2)]), Sign::Apply)
            .unwrap();
        assert!(stats.documents >= 3);

        let bench = series.load(&bench()).unwrap().unwrap();
        let bucket = &bench.weeks["2024-01-15"];
        assert_eq!(bucket.sets, 3.0);
        assert_eq!(bucket.hard_sets, 3.0);
        assert_eq!(bucket.volume, 1440.0);
        assert_eq!(bucket.e1rm_max, Some(76.0));
        assert_eq!(bench.exercise_name.as_deref(), Some("Bench Press"));

        let chest = series
            .load(&SeriesKey::new(TargetKind::MuscleGroup, "chest"))
            .unwrap()
            .unwrap();
        assert!((chest.weeks["2024-01-15"].effective_volume - 1008.0).abs() < 1e-6);
        assert!(series
            .load(&SeriesKey::new(TargetKind::Muscle, "pectoralis_major"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_extrema_only_extend_on_apply() {
        let store = MemoryStore::default();
        let series = SeriesStore::new(&store);
        series.apply(&deltas("w1", &[(5, 100.0, 1)]), Sign::Apply).unwrap();
        series.apply(&deltas("w2", &[(5, 80.0, 3)]), Sign::Apply).unwrap();

        let bucket = series.load(&bench()).unwrap().unwrap().weeks["2024-01-15"].clone();
        assert_eq!(bucket.e1rm_max, Some(116.7));
        assert_eq!(bucket.load_max, Some(100.0));
        assert_eq!(bucket.load_min, Some(80.0));
        assert_eq!(bucket.rir_min, Some(1.0));
        assert_eq!(bucket.rir_max, Some(3.0));
    }

    #[test]
    fn test_retract_inverts_additive_and_keeps_extrema() {
        let store = MemoryStore::default();
        let series = SeriesStore::new(&store);
        let d1 = deltas("w1", &[(5, 100.0, 1)]);
        series.apply(&d1, Sign::Apply).unwrap();
        series.apply(&deltas("w2", &[(5, 80.0, 3)]), Sign::Apply).unwrap();
        series.apply(&d1, Sign::Retract).unwrap();

        let bucket = series.load(&bench()).unwrap().unwrap().weeks["2024-01-15"].clone();
        assert_eq!(bucket.sets, 1.0);
        assert_eq!(bucket.volume, 400.0);
        // Known gap: max is not lowered by a retraction
        assert_eq!(bucket.load_max, Some(100.0));
    }

    #[test]
    fn test_small_chunks_give_same_result() {
        let store = MemoryStore::default();
        let series = SeriesStore::new(&store).with_chunk_size(3);
        let stats = series
            .apply(&deltas("w1", &[(8, 60.0, 2), (10, 50.0, 0)]), Sign::Apply)
            .unwrap();
        assert!(stats.chunks > 1);
        let bucket = series.load(&bench()).unwrap().unwrap().weeks["2024-01-15"].clone();
        assert_eq!(bucket.sets, 2.0);
        assert_eq!(bucket.volume, 980.0);
    }

    #[test]
    fn test_chunk_failure_aborts() {
        let store = MemoryStore::new(2, 3);
        let series = SeriesStore::new(&store);
        // Oversized chunk cannot happen through SeriesStore; force a type clash instead
        store
            .commit(&[WriteOp::Put {
                doc: series_doc(&SeriesKey::new(TargetKind::MuscleGroup, "triceps")),
                value: json!({"weeks": "corrupt"}),
            }])
            .unwrap();
        let err = series
            .apply(&deltas("w1", &[(8, 60.0, 2)]), Sign::Apply)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_concurrent_workouts_commute() {
        let store = Arc::new(MemoryStore::new(500, 1000));
        std::thread::scope(|scope| {
            for i in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    let d = deltas(&format!("w{}", i), &[(5, 60.0 + f64::from(i), 1)]);
                    SeriesStore::new(store.as_ref()).apply(&d, Sign::Apply).unwrap();
                });
            }
        });
        let series = SeriesStore::new(store.as_ref());
        let bucket = series.load(&bench()).unwrap().unwrap().weeks["2024-01-15"].clone();
        assert_eq!(bucket.sets, 8.0);
        assert_eq!(bucket.load_max, Some(67.0));
        assert_eq!(bucket.load_min, Some(60.0));
    }

    #[test]
    fn test_replace_and_purge() {
        let store = MemoryStore::default();
        let series = SeriesStore::new(&store);
        series.apply(&deltas("w1", &[(5, 100.0, 1)]), Sign::Apply).unwrap();

        let bucket = WeekBucket {
            sets: 1.0,
            set_count: 1.0,
            load_max: Some(80.0),
            ..Default::default()
        };
        series.replace_bucket(&bench(), week(), &bucket, None).unwrap();
        let loaded = series.load(&bench()).unwrap().unwrap();
        assert_eq!(loaded.weeks["2024-01-15"], bucket);
        assert_eq!(loaded.weeks.len(), 1);

        assert!(series.purge(&bench()).unwrap());
        assert!(!series.purge(&bench()).unwrap());
        assert!(series.load(&bench()).unwrap().is_none());
    }

    #[test]
    fn test_week_point_derivations() {
        let bucket = WeekBucket {
            sets: 4.0,
            rir_sum: 2.0,
            rir_count: 4.0,
            failure_sets: 2.0,
            set_count: 4.0,
            ..Default::default()
        };
        let point = WeekPoint::from_bucket(week(), &bucket);
        assert_eq!(point.avg_rir, Some(0.5));
        assert_eq!(point.failure_rate, Some(0.5));
        assert!(point.has_data());
        assert!(!WeekPoint::from_bucket(week(), &WeekBucket::default()).has_data());
    }
}
