//! Set fact generation.
//!
//! Turns one completed workout into immutable, attributed per-set facts.
//! Missing optional data (load, reps, attribution) degrades to zero/null
//! values; a set is never dropped because it is incomplete.

use crate::catalog::{AttributionProvider, Contributions};
use crate::week::week_start;
use crate::{Result, SetFact, SetInput, WeightUnit, WorkoutInput};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Pounds to kilograms
pub const LB_TO_KG: f64 = 0.453592;

/// Highest rep count the Epley estimate is trusted for
pub const E1RM_MAX_REPS: u32 = 12;

/// Credit given to a working set whose RIR was not logged
pub const UNKNOWN_RIR_CREDIT: f64 = 0.75;

/// Round to one decimal place
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Deterministic set identity from (workout, exercise, per-exercise index)
pub fn derive_set_id(workout_id: &str, exercise_id: &str, set_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workout_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(exercise_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(set_index.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Resolve a set's load in kilograms
///
/// A kg-denominated field is used verbatim; otherwise the declared unit is
/// converted. Missing, negative or non-finite loads become 0.
pub fn normalize_weight(set: &SetInput, unit: WeightUnit) -> f64 {
    let valid = |w: &f64| w.is_finite() && *w >= 0.0;
    if let Some(kg) = set.weight_kg.filter(valid) {
        return kg;
    }
    match (set.weight.filter(valid), unit) {
        (Some(w), WeightUnit::Kg) => w,
        (Some(w), WeightUnit::Lb) => round1(w * LB_TO_KG),
        (None, _) => 0.0,
    }
}

/// Epley one-rep-max estimate; only defined for 1..=12 reps with a load
pub fn epley_e1rm(weight_kg: f64, reps: u32) -> Option<f64> {
    if weight_kg <= 0.0 {
        return None;
    }
    match reps {
        1 => Some(weight_kg),
        2..=E1RM_MAX_REPS => Some(round1(weight_kg * (1.0 + f64::from(reps) / 30.0))),
        _ => None,
    }
}

/// Confidence of the e1RM estimate, falling as reps climb
pub fn e1rm_confidence(reps: u32) -> Option<f64> {
    match reps {
        1..=3 => Some(1.0),
        4..=6 => Some(0.9),
        7..=10 => Some(0.8),
        11..=E1RM_MAX_REPS => Some(0.7),
        _ => None,
    }
}

/// Proximity-to-failure credit in {0, 0.5, 0.75, 1.0}
pub fn hard_set_credit(is_warmup: bool, is_failure: bool, rir: Option<i32>) -> f64 {
    if is_warmup {
        return 0.0;
    }
    if is_failure {
        return 1.0;
    }
    match rir {
        None => UNKNOWN_RIR_CREDIT,
        Some(r) if r <= 2 => 1.0,
        Some(3) | Some(4) => 0.5,
        Some(_) => 0.0,
    }
}

fn scaled(weights: &BTreeMap<String, f64>, amount: f64) -> BTreeMap<String, f64> {
    weights
        .iter()
        .map(|(key, weight)| (key.clone(), amount * weight))
        .collect()
}

/// Generate the facts for one workout, in logged order
pub fn generate_set_facts(
    workout: &WorkoutInput,
    catalog: &dyn AttributionProvider,
) -> Result<Vec<SetFact>> {
    workout.validate()?;

    let week = week_start(workout.ended_at);
    let mut facts = Vec::new();
    // An exercise logged in two blocks keeps counting where it left off
    let mut next_index: HashMap<&str, u32> = HashMap::new();

    for exercise in &workout.exercises {
        let exercise_id = exercise.exercise_id.as_str();
        let unit = exercise.weight_unit.unwrap_or(workout.weight_unit);

        let profile = catalog.lookup(exercise_id);
        if profile.is_none() {
            tracing::warn!(
                "No attribution for exercise '{}' in workout {}; recording exercise-level only",
                exercise_id,
                workout.workout_id
            );
        }
        let contributions = profile
            .as_ref()
            .map(|p| p.contributions.normalized())
            .unwrap_or_else(Contributions::default);
        let exercise_name = exercise
            .name
            .clone()
            .or_else(|| profile.as_ref().and_then(|p| p.name.clone()));

        for set in &exercise.sets {
            let counter = next_index.entry(exercise_id).or_insert(0);
            let set_index = *counter;
            *counter += 1;

            if set.completed == Some(false) {
                tracing::debug!(
                    "Skipping uncompleted set {} of '{}'",
                    set_index,
                    exercise_id
                );
                continue;
            }

            let reps = set.reps.unwrap_or(0);
            let weight_kg = normalize_weight(set, unit);
            let volume = f64::from(reps) * weight_kg;
            let credit = hard_set_credit(set.is_warmup, set.is_failure, set.rir);

            facts.push(SetFact {
                set_id: derive_set_id(&workout.workout_id, exercise_id, set_index),
                workout_id: workout.workout_id.clone(),
                exercise_id: exercise_id.to_string(),
                exercise_name: exercise_name.clone(),
                set_index,
                performed_at: workout.ended_at,
                week_start: week,
                reps,
                weight_kg,
                rir: set.rir,
                rpe: set.rpe.filter(|r| r.is_finite()),
                is_warmup: set.is_warmup,
                is_failure: set.is_failure,
                volume,
                e1rm: epley_e1rm(weight_kg, reps),
                e1rm_confidence: e1rm_confidence(reps),
                hard_set_credit: credit,
                equipment: profile.as_ref().and_then(|p| p.equipment.clone()),
                movement_pattern: profile.as_ref().and_then(|p| p.movement_pattern.clone()),
                effective_volume_by_group: scaled(&contributions.groups, volume),
                effective_volume_by_muscle: scaled(&contributions.muscles, volume),
                hard_set_credit_by_group: scaled(&contributions.groups, credit),
                hard_set_credit_by_muscle: scaled(&contributions.muscles, credit),
                muscle_group_contrib: contributions.groups.clone(),
                muscle_contrib: contributions.muscles.clone(),
            });
        }
    }

    tracing::debug!(
        "Generated {} set facts for workout {}",
        facts.len(),
        workout.workout_id
    );
    Ok(facts)
}
