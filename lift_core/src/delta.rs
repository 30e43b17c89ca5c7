//! Delta aggregation.
//!
//! Folds the set facts of one workout into per-target delta records for a
//! single week. A set fans out to every muscle group and muscle it trains,
//! weighted by its contribution; warmups never feed a series.

use crate::{SeriesKey, SetFact, TargetKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Raw set counts per rep range
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct RepsBuckets {
    #[serde(rename = "1-5", default)]
    pub r1_5: f64,
    #[serde(rename = "6-10", default)]
    pub r6_10: f64,
    #[serde(rename = "11-15", default)]
    pub r11_15: f64,
    #[serde(rename = "16-20", default)]
    pub r16_20: f64,
}

impl RepsBuckets {
    pub fn add(&mut self, reps: u32, amount: f64) {
        match reps {
            1..=5 => self.r1_5 += amount,
            6..=10 => self.r6_10 += amount,
            11..=15 => self.r11_15 += amount,
            16..=20 => self.r16_20 += amount,
            _ => {}
        }
    }

    /// (field, value) pairs in range order
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("1-5", self.r1_5),
            ("6-10", self.r6_10),
            ("11-15", self.r11_15),
            ("16-20", self.r16_20),
        ]
    }

    pub fn merge(&mut self, other: &RepsBuckets) {
        self.r1_5 += other.r1_5;
        self.r6_10 += other.r6_10;
        self.r11_15 += other.r11_15;
        self.r16_20 += other.r16_20;
    }
}

/// Accumulated change to one weekly bucket
///
/// For muscle-group and muscle targets `sets`, `hard_sets`,
/// `effective_volume`, `rir_sum`, `rir_count` and `failure_sets` are
/// contribution-weighted; `volume`, `set_count` and `reps_bucket` are raw.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct DeltaRecord {
    pub sets: f64,
    pub hard_sets: f64,
    pub volume: f64,
    pub effective_volume: f64,
    pub rir_sum: f64,
    pub rir_count: f64,
    pub failure_sets: f64,
    pub set_count: f64,
    pub reps_bucket: RepsBuckets,

    pub e1rm_max: Option<f64>,
    pub load_min: Option<f64>,
    pub load_max: Option<f64>,
    pub rir_min: Option<f64>,
    pub rir_max: Option<f64>,

    pub exercise_name: Option<String>,
}

fn keep_max(current: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn keep_min(current: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl DeltaRecord {
    /// Fold one set into this record with the given contribution weight
    pub fn add_set(&mut self, fact: &SetFact, weight: f64) {
        self.sets += weight;
        self.hard_sets += fact.hard_set_credit * weight;
        self.volume += fact.volume;
        self.effective_volume += fact.volume * weight;
        if let Some(rir) = fact.rir {
            self.rir_sum += f64::from(rir) * weight;
            self.rir_count += weight;
        }
        if fact.is_failure {
            self.failure_sets += weight;
        }
        self.set_count += 1.0;
        self.reps_bucket.add(fact.reps, 1.0);

        self.e1rm_max = keep_max(self.e1rm_max, fact.e1rm);
        let load = (fact.weight_kg > 0.0).then_some(fact.weight_kg);
        self.load_min = keep_min(self.load_min, load);
        self.load_max = keep_max(self.load_max, load);
        let rir = fact.rir.map(f64::from);
        self.rir_min = keep_min(self.rir_min, rir);
        self.rir_max = keep_max(self.rir_max, rir);

        if self.exercise_name.is_none() {
            self.exercise_name = fact.exercise_name.clone();
        }
    }

    /// Whether any extremal field carries a value
    pub fn has_extrema(&self) -> bool {
        self.e1rm_max.is_some()
            || self.load_min.is_some()
            || self.load_max.is_some()
            || self.rir_min.is_some()
            || self.rir_max.is_some()
    }

    /// Additive fields as (bucket field path, amount); rep buckets nest one level
    pub fn additive_fields(&self) -> Vec<(Vec<&'static str>, f64)> {
        let mut fields = vec![
            (vec!["sets"], self.sets),
            (vec!["hard_sets"], self.hard_sets),
            (vec!["volume"], self.volume),
            (vec!["effective_volume"], self.effective_volume),
            (vec!["rir_sum"], self.rir_sum),
            (vec!["rir_count"], self.rir_count),
            (vec!["failure_sets"], self.failure_sets),
            (vec!["set_count"], self.set_count),
        ];
        for (name, value) in self.reps_bucket.entries() {
            fields.push((vec!["reps_bucket", name], value));
        }
        fields
    }
}

/// The three delta families produced for one workout-week
#[derive(Clone, Debug, PartialEq)]
pub struct Deltas {
    pub week_start: NaiveDate,
    pub exercises: BTreeMap<String, DeltaRecord>,
    pub muscle_groups: BTreeMap<String, DeltaRecord>,
    pub muscles: BTreeMap<String, DeltaRecord>,
}

impl Deltas {
    pub fn new(week_start: NaiveDate) -> Self {
        Self {
            week_start,
            exercises: BTreeMap::new(),
            muscle_groups: BTreeMap::new(),
            muscles: BTreeMap::new(),
        }
    }

    pub fn family(&self, kind: TargetKind) -> &BTreeMap<String, DeltaRecord> {
        match kind {
            TargetKind::Exercise => &self.exercises,
            TargetKind::MuscleGroup => &self.muscle_groups,
            TargetKind::Muscle => &self.muscles,
        }
    }

    /// Every (target, record) across the three families
    pub fn iter(&self) -> impl Iterator<Item = (SeriesKey, &DeltaRecord)> {
        TargetKind::ALL.into_iter().flat_map(move |kind| {
            self.family(kind)
                .iter()
                .map(move |(key, record)| (SeriesKey::new(kind, key.clone()), record))
        })
    }

    pub fn targets(&self) -> BTreeSet<SeriesKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty() && self.muscle_groups.is_empty() && self.muscles.is_empty()
    }
}

/// Fold a workout's facts into delta records for `week_start`
pub fn aggregate(facts: &[SetFact], week_start: NaiveDate) -> Deltas {
    let mut deltas = Deltas::new(week_start);

    for fact in facts.iter().filter(|f| !f.is_warmup) {
        deltas
            .exercises
            .entry(fact.exercise_id.clone())
            .or_default()
            .add_set(fact, 1.0);

        for (group, weight) in &fact.muscle_group_contrib {
            if *weight > 0.0 {
                deltas
                    .muscle_groups
                    .entry(group.clone())
                    .or_default()
                    .add_set(fact, *weight);
            }
        }

        for (muscle, weight) in &fact.muscle_contrib {
            if *weight > 0.0 {
                deltas
                    .muscles
                    .entry(muscle.clone())
                    .or_default()
                    .add_set(fact, *weight);
            }
        }
    }

    // Names are only carried on exercise records
    for record in deltas
        .muscle_groups
        .values_mut()
        .chain(deltas.muscles.values_mut())
    {
        record.exercise_name = None;
    }

    deltas
}

/// Recompute a single target's record from raw facts (reconciliation)
pub fn aggregate_target(facts: &[SetFact], kind: TargetKind, key: &str) -> Option<DeltaRecord> {
    let mut record: Option<DeltaRecord> = None;
    for fact in facts.iter().filter(|f| !f.is_warmup) {
        let weight = fact.weight_for(kind, key);
        if weight > 0.0 {
            record.get_or_insert_with(DeltaRecord::default).add_set(fact, weight);
        }
    }
    if kind != TargetKind::Exercise {
        if let Some(r) = record.as_mut() {
            r.exercise_name = None;
        }
    }
    record
}
