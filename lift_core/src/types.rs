//! Core domain types for the training-load rollup engine.
//!
//! This module defines the fundamental types used throughout the system:
//! - Workout inputs as delivered by the logging client
//! - Immutable per-set facts derived from them
//! - Series target addressing (exercise, muscle group, muscle)

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Workout Input Types
// ============================================================================

/// Unit a workout (or a single exercise) logged its loads in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightUnit {
    #[default]
    Kg,
    #[serde(alias = "lbs", alias = "pound", alias = "pounds")]
    Lb,
}

/// One logged set.
///
/// `weight_kg` wins when present; otherwise `weight` is read in the
/// exercise's (or workout's) declared unit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SetInput {
    #[serde(default)]
    pub reps: Option<u32>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub rir: Option<i32>,
    #[serde(default)]
    pub rpe: Option<f64>,
    #[serde(default)]
    pub is_warmup: bool,
    #[serde(default)]
    pub is_failure: bool,
    /// `Some(false)` marks a planned set the lifter never performed
    #[serde(default)]
    pub completed: Option<bool>,
}

/// One exercise block of a workout
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExerciseInput {
    pub exercise_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the workout-level unit for this block
    #[serde(default)]
    pub weight_unit: Option<WeightUnit>,
    #[serde(default)]
    pub sets: Vec<SetInput>,
}

/// A completed workout as delivered by the completion trigger
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkoutInput {
    #[serde(default)]
    pub workout_id: String,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub weight_unit: WeightUnit,
    #[serde(default)]
    pub exercises: Vec<ExerciseInput>,
}

impl WorkoutInput {
    /// Only structurally invalid input is fatal; missing set data is not
    pub fn validate(&self) -> Result<()> {
        if self.workout_id.trim().is_empty() {
            return Err(Error::invalid("workout is missing workout_id"));
        }
        if let Some(pos) = self
            .exercises
            .iter()
            .position(|e| e.exercise_id.trim().is_empty())
        {
            return Err(Error::invalid(format!(
                "exercise #{} of workout {} is missing exercise_id",
                pos, self.workout_id
            )));
        }
        Ok(())
    }

    /// Parse a workout from JSON, rejecting unknown shapes
    pub fn from_json(contents: &str) -> Result<Self> {
        let workout: WorkoutInput = serde_json::from_str(contents)
            .map_err(|e| Error::invalid(format!("malformed workout: {}", e)))?;
        workout.validate()?;
        Ok(workout)
    }
}

// ============================================================================
// Set Facts
// ============================================================================

/// Immutable, attributed record of one performed set
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SetFact {
    pub set_id: String,
    pub workout_id: String,
    pub exercise_id: String,
    #[serde(default)]
    pub exercise_name: Option<String>,
    pub set_index: u32,
    /// Stored as epoch milliseconds so the store can order on it
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub performed_at: DateTime<Utc>,
    pub week_start: NaiveDate,

    pub reps: u32,
    pub weight_kg: f64,
    #[serde(default)]
    pub rir: Option<i32>,
    #[serde(default)]
    pub rpe: Option<f64>,
    pub is_warmup: bool,
    pub is_failure: bool,

    pub volume: f64,
    #[serde(default)]
    pub e1rm: Option<f64>,
    #[serde(default)]
    pub e1rm_confidence: Option<f64>,
    pub hard_set_credit: f64,

    #[serde(default)]
    pub equipment: Option<String>,
    #[serde(default)]
    pub movement_pattern: Option<String>,

    #[serde(default)]
    pub muscle_group_contrib: BTreeMap<String, f64>,
    #[serde(default)]
    pub muscle_contrib: BTreeMap<String, f64>,
    #[serde(default)]
    pub effective_volume_by_group: BTreeMap<String, f64>,
    #[serde(default)]
    pub effective_volume_by_muscle: BTreeMap<String, f64>,
    #[serde(default)]
    pub hard_set_credit_by_group: BTreeMap<String, f64>,
    #[serde(default)]
    pub hard_set_credit_by_muscle: BTreeMap<String, f64>,
}

impl SetFact {
    /// Contribution weight of this set towards a target (1.0 for its own exercise)
    pub fn weight_for(&self, kind: TargetKind, key: &str) -> f64 {
        match kind {
            TargetKind::Exercise => {
                if self.exercise_id == key {
                    1.0
                } else {
                    0.0
                }
            }
            TargetKind::MuscleGroup => self.muscle_group_contrib.get(key).copied().unwrap_or(0.0),
            TargetKind::Muscle => self.muscle_contrib.get(key).copied().unwrap_or(0.0),
        }
    }

    /// Volume attributed to a target
    pub fn effective_volume_for(&self, kind: TargetKind, key: &str) -> f64 {
        self.volume * self.weight_for(kind, key)
    }
}

// ============================================================================
// Series Targets
// ============================================================================

/// Family of weekly series a delta is written to
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Exercise,
    MuscleGroup,
    Muscle,
}

impl TargetKind {
    pub const ALL: [TargetKind; 3] = [
        TargetKind::Exercise,
        TargetKind::MuscleGroup,
        TargetKind::Muscle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Exercise => "exercise",
            TargetKind::MuscleGroup => "muscle_group",
            TargetKind::Muscle => "muscle",
        }
    }

    /// Parse a kind name (case-insensitive, hyphens allowed)
    pub fn parse(s: &str) -> Result<Self> {
        match crate::catalog::normalize_key(s).as_str() {
            "exercise" => Ok(TargetKind::Exercise),
            "muscle_group" | "group" => Ok(TargetKind::MuscleGroup),
            "muscle" => Ok(TargetKind::Muscle),
            other => Err(Error::invalid(format!("unknown target kind: {}", other))),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved address of one weekly series
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub kind: TargetKind,
    pub id: String,
}

impl SeriesKey {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workout_rejects_unknown_fields() {
        let json = r#"{
            "workout_id": "w1",
            "ended_at": "2024-01-15T10:30:00Z",
            "exercises": [{"exercise_id": "bench", "sets": [{"reps": 5, "kilos": 60}]}]
        }"#;
        let err = WorkoutInput::from_json(json).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_workout_requires_id() {
        let json = r#"{"ended_at": "2024-01-15T10:30:00Z", "exercises": []}"#;
        let err = WorkoutInput::from_json(json).unwrap_err();
        assert!(err.to_string().contains("workout_id"));
    }

    #[test]
    fn test_weight_unit_aliases() {
        let unit: WeightUnit = serde_json::from_str("\"lbs\"").unwrap();
        assert_eq!(unit, WeightUnit::Lb);
        let unit: WeightUnit = serde_json::from_str("\"kg\"").unwrap();
        assert_eq!(unit, WeightUnit::Kg);
    }

    #[test]
    fn test_target_kind_parse() {
        assert_eq!(TargetKind::parse("Muscle-Group").unwrap(), TargetKind::MuscleGroup);
        assert_eq!(TargetKind::parse("exercise").unwrap(), TargetKind::Exercise);
        assert!(TargetKind::parse("joint").is_err());
    }
}
