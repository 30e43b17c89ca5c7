//! Exercise catalog lookups and muscle attribution.
//!
//! The catalog itself (identity, aliases, merges) lives outside this crate;
//! the rollup engine only needs to ask it which muscle groups and muscles an
//! exercise trains, and how strongly.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Normalize a catalog key: trimmed, lowercase, spaces and hyphens as underscores
pub fn normalize_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Normalized contribution weights of one exercise
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Contributions {
    #[serde(default)]
    pub groups: BTreeMap<String, f64>,
    #[serde(default)]
    pub muscles: BTreeMap<String, f64>,
}

impl Contributions {
    /// Normalize keys and clamp weights into [0, 1]
    ///
    /// Keys that collide after normalization keep the larger weight.
    /// Non-finite and zero weights are dropped.
    pub fn normalized(&self) -> Self {
        Self {
            groups: normalize_weights(&self.groups),
            muscles: normalize_weights(&self.muscles),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.muscles.is_empty()
    }
}

fn normalize_weights(raw: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let mut out: BTreeMap<String, f64> = BTreeMap::new();
    for (key, weight) in raw {
        if !weight.is_finite() || *weight <= 0.0 {
            continue;
        }
        let key = normalize_key(key);
        if key.is_empty() {
            continue;
        }
        let weight = weight.min(1.0);
        let entry = out.entry(key).or_insert(0.0);
        *entry = entry.max(weight);
    }
    out
}

/// What the catalog knows about one exercise
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExerciseProfile {
    pub exercise_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub equipment: Option<String>,
    #[serde(default)]
    pub movement_pattern: Option<String>,
    #[serde(default)]
    pub contributions: Contributions,
}

/// Lookup service mapping an exercise to its muscle attribution
pub trait AttributionProvider: Send + Sync {
    /// Look an exercise up by id or display name
    fn lookup(&self, exercise: &str) -> Option<ExerciseProfile>;

    /// Contribution weights for an exercise; absence means no contribution
    fn get_contributions(&self, exercise: &str) -> Contributions {
        self.lookup(exercise)
            .map(|profile| profile.contributions.normalized())
            .unwrap_or_default()
    }
}

/// Catalog file format
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    exercise: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    equipment: Option<String>,
    #[serde(default)]
    movement_pattern: Option<String>,
    #[serde(default)]
    groups: BTreeMap<String, f64>,
    #[serde(default)]
    muscles: BTreeMap<String, f64>,
}

/// In-memory catalog indexed by id and by normalized display name
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    exercises: HashMap<String, ExerciseProfile>,
    names: HashMap<String, String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an exercise
    pub fn insert(&mut self, profile: ExerciseProfile) {
        if let Some(name) = &profile.name {
            self.names
                .insert(normalize_key(name), profile.exercise_id.clone());
        }
        self.exercises.insert(profile.exercise_id.clone(), profile);
    }

    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }

    /// Load a catalog from a TOML file of `[[exercise]]` tables
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml(&contents)?;
        tracing::info!(
            "Loaded {} exercises from catalog {:?}",
            catalog.len(),
            path
        );
        Ok(catalog)
    }

    /// Load the catalog at `path`, or the built-in one when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(
                "No catalog found at {:?}, using built-in exercises",
                path
            );
            Ok(get_default_catalog().clone())
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(contents)?;
        let mut catalog = Self::new();
        for entry in file.exercise {
            catalog.insert(ExerciseProfile {
                exercise_id: entry.id,
                name: entry.name,
                equipment: entry.equipment,
                movement_pattern: entry.movement_pattern,
                contributions: Contributions {
                    groups: entry.groups,
                    muscles: entry.muscles,
                },
            });
        }
        let errors = catalog.validate();
        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "invalid catalog: {}",
                errors.join("; ")
            )));
        }
        Ok(catalog)
    }

    /// Validate the catalog for consistency
    ///
    /// Returns a list of validation errors, or empty Vec if valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (id, profile) in &self.exercises {
            if id.trim().is_empty() {
                errors.push("Exercise has empty ID".to_string());
            }
            let weights = profile
                .contributions
                .groups
                .iter()
                .chain(profile.contributions.muscles.iter());
            for (key, weight) in weights {
                if !(0.0..=1.0).contains(weight) {
                    errors.push(format!(
                        "Exercise '{}': weight {} for '{}' is outside [0, 1]",
                        id, weight, key
                    ));
                }
            }
        }

        errors
    }
}

impl AttributionProvider for StaticCatalog {
    fn lookup(&self, exercise: &str) -> Option<ExerciseProfile> {
        if let Some(profile) = self.exercises.get(exercise) {
            return Some(profile.clone());
        }
        let key = normalize_key(exercise);
        self.exercises
            .get(&key)
            .or_else(|| self.names.get(&key).and_then(|id| self.exercises.get(id)))
            .cloned()
    }
}

/// Cached built-in catalog
static DEFAULT_CATALOG: Lazy<StaticCatalog> = Lazy::new(build_default_catalog);

/// Get a reference to the built-in catalog
pub fn get_default_catalog() -> &'static StaticCatalog {
    &DEFAULT_CATALOG
}

fn profile(
    id: &str,
    name: &str,
    equipment: &str,
    pattern: &str,
    groups: &[(&str, f64)],
    muscles: &[(&str, f64)],
) -> ExerciseProfile {
    ExerciseProfile {
        exercise_id: id.into(),
        name: Some(name.into()),
        equipment: Some(equipment.into()),
        movement_pattern: Some(pattern.into()),
        contributions: Contributions {
            groups: groups.iter().map(|(k, w)| (k.to_string(), *w)).collect(),
            muscles: muscles.iter().map(|(k, w)| (k.to_string(), *w)).collect(),
        },
    }
}

/// Builds the built-in catalog of common barbell lifts
pub fn build_default_catalog() -> StaticCatalog {
    let mut catalog = StaticCatalog::new();

    catalog.insert(profile(
        "bench_press",
        "Bench Press",
        "barbell",
        "horizontal_push",
        &[("chest", 0.7), ("triceps", 0.3)],
        &[
            ("pectoralis_major", 0.7),
            ("anterior_deltoid", 0.2),
            ("triceps_brachii", 0.3),
        ],
    ));
    catalog.insert(profile(
        "back_squat",
        "Back Squat",
        "barbell",
        "squat",
        &[("quads", 0.6), ("glutes", 0.3)],
        &[("quadriceps", 0.6), ("gluteus_maximus", 0.3), ("adductors", 0.1)],
    ));
    catalog.insert(profile(
        "deadlift",
        "Deadlift",
        "barbell",
        "hinge",
        &[("hamstrings", 0.3), ("glutes", 0.3), ("back", 0.4)],
        &[
            ("hamstrings", 0.3),
            ("gluteus_maximus", 0.3),
            ("erector_spinae", 0.4),
        ],
    ));
    catalog.insert(profile(
        "overhead_press",
        "Overhead Press",
        "barbell",
        "vertical_push",
        &[("shoulders", 0.7), ("triceps", 0.3)],
        &[("anterior_deltoid", 0.7), ("triceps_brachii", 0.3)],
    ));
    catalog.insert(profile(
        "barbell_row",
        "Barbell Row",
        "barbell",
        "horizontal_pull",
        &[("back", 0.7), ("biceps", 0.2)],
        &[("latissimus_dorsi", 0.5), ("rhomboids", 0.3), ("biceps_brachii", 0.2)],
    ));
    catalog.insert(profile(
        "pull_up",
        "Pull-up",
        "bodyweight",
        "vertical_pull",
        &[("back", 0.7), ("biceps", 0.3)],
        &[("latissimus_dorsi", 0.7), ("biceps_brachii", 0.3)],
    ));

    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Upper Chest"), "upper_chest");
        assert_eq!(normalize_key("rear-delts"), "rear_delts");
        assert_eq!(normalize_key("  Lats "), "lats");
    }

    #[test]
    fn test_contributions_normalized() {
        let raw = Contributions {
            groups: [
                ("Upper Chest".to_string(), 0.4),
                ("upper-chest".to_string(), 0.6),
                ("Triceps".to_string(), 1.5),
                ("calves".to_string(), 0.0),
                ("neck".to_string(), f64::NAN),
            ]
            .into_iter()
            .collect(),
            muscles: BTreeMap::new(),
        };
        let normalized = raw.normalized();
        assert_eq!(normalized.groups.len(), 2);
        assert_eq!(normalized.groups["upper_chest"], 0.6);
        assert_eq!(normalized.groups["triceps"], 1.0);
    }

    #[test]
    fn test_catalog_loads() {
        let catalog = build_default_catalog();
        assert!(!catalog.is_empty());
        assert!(catalog.validate().is_empty());
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let catalog = get_default_catalog();
        let by_id = catalog.lookup("bench_press").unwrap();
        let by_name = catalog.lookup("Bench Press").unwrap();
        assert_eq!(by_id, by_name);
        assert!(catalog.lookup("zercher_squat").is_none());
    }

    #[test]
    fn test_missing_exercise_has_no_contributions() {
        let catalog = StaticCatalog::new();
        assert!(catalog.get_contributions("anything").is_empty());
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
[[exercise]]
id = "dip"
name = "Parallel Bar Dip"
equipment = "bodyweight"
groups = { "Chest" = 0.5, "Triceps" = 0.5 }
muscles = { "triceps brachii" = 0.5 }
"#;
        let catalog = StaticCatalog::from_toml(toml_str).unwrap();
        let contrib = catalog.get_contributions("dip");
        assert_eq!(contrib.groups["chest"], 0.5);
        assert_eq!(contrib.muscles["triceps_brachii"], 0.5);
        assert!(catalog.lookup("parallel bar dip").is_some());
    }

    #[test]
    fn test_out_of_range_weight_rejected() {
        let toml_str = r#"
[[exercise]]
id = "dip"
groups = { chest = 1.4 }
"#;
        assert!(matches!(
            StaticCatalog::from_toml(toml_str),
            Err(Error::Config(_))
        ));
    }
}
