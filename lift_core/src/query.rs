//! Capped, paginated reads for agent-facing endpoints.
//!
//! Every read names exactly one target, clamps its limit and projection,
//! and stays under a serialized-size budget. Date sorts page natively in
//! the store; value sorts rank a bounded candidate window in memory and
//! report `approximate` when the window was full.

use crate::catalog::{normalize_key, AttributionProvider};
use crate::config::CapsConfig;
use crate::cursor::{QueryCursor, SortMode};
use crate::delta::RepsBuckets;
use crate::progress::{detect_flags, trend_direction, TrendDirection, TrendFlags};
use crate::rollup::{decode_facts, target_filter, FACTS_COLLECTION};
use crate::series::{SeriesStore, WeekPoint};
use crate::store::{path, Direction, DocumentStore, Filter, StoreQuery};
use crate::week::{week_key, window};
use crate::{Error, Result, SeriesKey, SetFact, TargetKind};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Window used when a request does not name one
pub const DEFAULT_WINDOW_WEEKS: u32 = 12;

/// Fields a set query may project
static SET_FIELDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "set_id",
        "workout_id",
        "exercise_id",
        "exercise_name",
        "set_index",
        "performed_at",
        "week_start",
        "reps",
        "weight_kg",
        "rir",
        "rpe",
        "is_warmup",
        "is_failure",
        "volume",
        "e1rm",
        "e1rm_confidence",
        "hard_set_credit",
        "equipment",
        "movement_pattern",
        "muscle_group_contrib",
        "muscle_contrib",
        "effective_volume_by_group",
        "effective_volume_by_muscle",
    ]
    .into_iter()
    .collect()
});

const DEFAULT_SET_FIELDS: [&str; 10] = [
    "set_id",
    "exercise_id",
    "exercise_name",
    "performed_at",
    "reps",
    "weight_kg",
    "rir",
    "volume",
    "e1rm",
    "hard_set_credit",
];

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SetQueryRequest {
    #[serde(default)]
    pub exercise_ids: Vec<String>,
    #[serde(default)]
    pub muscle_group: Option<String>,
    #[serde(default)]
    pub muscle: Option<String>,
    /// Inclusive UTC dates
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub include_warmups: bool,
    #[serde(default)]
    pub equipment: Option<String>,
    #[serde(default)]
    pub movement_pattern: Option<String>,
    #[serde(default)]
    pub min_hard_set_credit: Option<f64>,
    #[serde(default)]
    pub max_rir: Option<i32>,
    #[serde(default)]
    pub failure_only: bool,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SetQueryResponse {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub applied_limit: usize,
    /// A value sort ranked only the newest `candidate_window` sets
    pub approximate: bool,
    /// Items were dropped to stay under the response size budget
    pub truncated: bool,
}

/// Target of a series or progress read
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SeriesTarget {
    ExerciseId(String),
    ExerciseName(String),
    MuscleGroup(String),
    Muscle(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SeriesRequest {
    pub target: SeriesTarget,
    #[serde(default)]
    pub window_weeks: Option<u32>,
    /// Last week of the window; defaults to today
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SeriesSummary {
    pub total_weeks: usize,
    pub avg_weekly_sets: f64,
    pub avg_weekly_volume: f64,
    pub trend_direction: TrendDirection,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SeriesResponse {
    pub target: SeriesKey,
    pub exercise_name: Option<String>,
    pub window_weeks: u32,
    pub weekly_points: Vec<WeekPoint>,
    pub summary: SeriesSummary,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProgressRequest {
    pub target: SeriesTarget,
    #[serde(default)]
    pub window_weeks: Option<u32>,
    #[serde(default)]
    pub include_distribution: bool,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ExerciseContribution {
    pub exercise_id: String,
    pub exercise_name: Option<String>,
    pub effective_volume: f64,
    pub sets: f64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProgressResponse {
    pub target: SeriesKey,
    pub weekly_points: Vec<WeekPoint>,
    pub flags: TrendFlags,
    pub trend_direction: TrendDirection,
    pub top_exercises: Vec<ExerciseContribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rep_distribution: Option<RepsBuckets>,
}

// ============================================================================
// Target resolution
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum SetTarget {
    Exercises(Vec<String>),
    Group(SeriesKey),
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn ms(ts: chrono::DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn day_start_ms(date: NaiveDate) -> i64 {
    ms(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

/// Serves the read endpoints; never writes
pub struct QueryCapsEngine {
    store: Arc<dyn DocumentStore>,
    catalog: Arc<dyn AttributionProvider>,
    caps: CapsConfig,
}

impl QueryCapsEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        catalog: Arc<dyn AttributionProvider>,
        caps: CapsConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            caps,
        }
    }

    /// Clamp a requested limit into [1, max_limit]
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.caps.default_limit)
            .clamp(1, self.caps.max_limit.max(1))
    }

    /// Requested fields narrowed to the allow-list; `set_id` is always kept
    pub fn project_fields(&self, requested: &[String]) -> Vec<&'static str> {
        let mut fields: Vec<&'static str> = Vec::new();
        for name in requested {
            match SET_FIELDS.get(name.trim()) {
                Some(field) if !fields.contains(field) => fields.push(*field),
                Some(_) => {}
                None => tracing::debug!("Dropping unknown projection field '{}'", name),
            }
        }
        if fields.is_empty() {
            fields.extend(DEFAULT_SET_FIELDS);
        }
        if !fields.contains(&"set_id") {
            fields.insert(0, "set_id");
        }
        fields
    }

    fn resolve_set_target(&self, req: &SetQueryRequest) -> Result<SetTarget> {
        let exercises: Vec<String> = req
            .exercise_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        let group = non_blank(&req.muscle_group);
        let muscle = non_blank(&req.muscle);

        let given = usize::from(!exercises.is_empty())
            + usize::from(group.is_some())
            + usize::from(muscle.is_some());
        if given != 1 {
            return Err(Error::invalid(format!(
                "exactly one of exercise_ids, muscle_group or muscle is required ({} given)",
                given
            )));
        }

        if !exercises.is_empty() {
            if exercises.len() > self.caps.max_exercise_ids {
                return Err(Error::invalid(format!(
                    "at most {} exercise_ids may be queried at once",
                    self.caps.max_exercise_ids
                )));
            }
            return Ok(SetTarget::Exercises(exercises));
        }
        Ok(match (group, muscle) {
            (Some(g), _) => SetTarget::Group(SeriesKey::new(TargetKind::MuscleGroup, normalize_key(g))),
            (_, Some(m)) => SetTarget::Group(SeriesKey::new(TargetKind::Muscle, normalize_key(m))),
            _ => return Err(Error::internal("target resolution fell through")),
        })
    }

    /// Resolve a series target to its document key
    pub fn resolve_series_target(&self, target: &SeriesTarget) -> Result<SeriesKey> {
        let raw = match target {
            SeriesTarget::ExerciseId(s)
            | SeriesTarget::ExerciseName(s)
            | SeriesTarget::MuscleGroup(s)
            | SeriesTarget::Muscle(s) => s.trim(),
        };
        if raw.is_empty() {
            return Err(Error::invalid("series target must not be empty"));
        }
        Ok(match target {
            SeriesTarget::ExerciseId(_) => SeriesKey::new(TargetKind::Exercise, raw),
            SeriesTarget::ExerciseName(_) => {
                let id = self
                    .catalog
                    .lookup(raw)
                    .map(|profile| profile.exercise_id)
                    .unwrap_or_else(|| {
                        tracing::debug!("Exercise name '{}' not in catalog; using it as id", raw);
                        normalize_key(raw)
                    });
                SeriesKey::new(TargetKind::Exercise, id)
            }
            SeriesTarget::MuscleGroup(_) => SeriesKey::new(TargetKind::MuscleGroup, normalize_key(raw)),
            SeriesTarget::Muscle(_) => SeriesKey::new(TargetKind::Muscle, normalize_key(raw)),
        })
    }

    fn window_weeks(&self, requested: Option<u32>) -> Result<u32> {
        let weeks = requested.unwrap_or_else(|| DEFAULT_WINDOW_WEEKS.min(self.caps.max_weeks));
        if weeks == 0 || weeks > self.caps.max_weeks {
            return Err(Error::invalid(format!(
                "window_weeks must be between 1 and {} (got {})",
                self.caps.max_weeks, weeks
            )));
        }
        Ok(weeks)
    }

    // ========================================================================
    // Raw set query
    // ========================================================================

    pub fn query_sets(&self, req: &SetQueryRequest) -> Result<SetQueryResponse> {
        let target = self.resolve_set_target(req)?;
        let sort = match &req.sort {
            Some(s) => SortMode::parse(s)?,
            None => SortMode::default(),
        };
        let cursor = req
            .cursor
            .as_deref()
            .map(|token| QueryCursor::decode_for(token, sort))
            .transpose()?;
        if let (Some(from), Some(to)) = (req.from, req.to) {
            if from > to {
                return Err(Error::invalid(format!("from {} is after to {}", from, to)));
            }
        }
        let limit = self.clamp_limit(req.limit);
        let fields = self.project_fields(&req.fields);

        let base = self.filtered_query(&target, req);
        let (mut ranked, approximate) = if sort.is_native() {
            (self.native_page(base, sort, cursor.as_ref(), limit)?, false)
        } else {
            self.ranked_page(base, &target, sort, cursor.as_ref(), limit)?
        };

        let mut has_more = ranked.len() > limit;
        ranked.truncate(limit);

        let mut items = Vec::with_capacity(ranked.len());
        let mut budget = self.caps.max_response_bytes;
        let mut truncated = false;
        let mut last: Option<(f64, String)> = None;
        for (value, fact) in ranked {
            let item = project(&fact, &fields)?;
            let size = serde_json::to_vec(&item)?.len() + 1;
            if size > budget && !items.is_empty() {
                truncated = true;
                has_more = true;
                break;
            }
            budget = budget.saturating_sub(size);
            last = Some((value, fact.set_id.clone()));
            items.push(item);
        }

        let next_cursor = match (has_more, last) {
            (true, Some((value, id))) => Some(QueryCursor::new(sort, value, id).encode()?),
            _ => None,
        };
        if truncated {
            tracing::debug!("Set query truncated to {} items by size budget", items.len());
        }

        Ok(SetQueryResponse {
            items,
            next_cursor,
            has_more,
            applied_limit: limit,
            approximate,
            truncated,
        })
    }

    fn filtered_query(&self, target: &SetTarget, req: &SetQueryRequest) -> StoreQuery {
        let mut query = StoreQuery::new(FACTS_COLLECTION);
        query = match target {
            SetTarget::Exercises(ids) if ids.len() == 1 => {
                query.filter(Filter::Eq(path(&["exercise_id"]), json!(ids[0])))
            }
            SetTarget::Exercises(ids) => query.filter(Filter::In(
                path(&["exercise_id"]),
                ids.iter().map(|id| json!(id)).collect(),
            )),
            SetTarget::Group(key) => query.filter(target_filter(key)),
        };
        if let Some(from) = req.from {
            query = query.filter(Filter::Gte(path(&["performed_at"]), json!(day_start_ms(from))));
        }
        if let Some(to) = req.to {
            let end = day_start_ms(to + Duration::days(1)) - 1;
            query = query.filter(Filter::Lte(path(&["performed_at"]), json!(end)));
        }
        if !req.include_warmups {
            query = query.filter(Filter::Eq(path(&["is_warmup"]), json!(false)));
        }
        if let Some(equipment) = non_blank(&req.equipment) {
            query = query.filter(Filter::Eq(path(&["equipment"]), json!(normalize_key(equipment))));
        }
        if let Some(pattern) = non_blank(&req.movement_pattern) {
            query = query.filter(Filter::Eq(
                path(&["movement_pattern"]),
                json!(normalize_key(pattern)),
            ));
        }
        if let Some(credit) = req.min_hard_set_credit {
            query = query.filter(Filter::Gte(path(&["hard_set_credit"]), json!(credit)));
        }
        if let Some(rir) = req.max_rir {
            query = query.filter(Filter::Lte(path(&["rir"]), json!(rir)));
        }
        if req.failure_only {
            query = query.filter(Filter::Eq(path(&["is_failure"]), json!(true)));
        }
        query
    }

    /// Store-ordered page of `limit + 1` facts
    fn native_page(
        &self,
        base: StoreQuery,
        sort: SortMode,
        cursor: Option<&QueryCursor>,
        limit: usize,
    ) -> Result<Vec<(f64, SetFact)>> {
        let direction = match sort {
            SortMode::DateAsc => Direction::Asc,
            _ => Direction::Desc,
        };
        let mut query = base
            .order_by(path(&["performed_at"]), direction)
            .limit(limit + 1);
        if let Some(cursor) = cursor {
            query = query.start_after(json!(cursor.last_value as i64), cursor.last_id.clone());
        }
        let facts = decode_facts(self.store.query(&query)?)?;
        Ok(facts
            .into_iter()
            .map(|f| (ms(f.performed_at) as f64, f))
            .collect())
    }

    /// Newest `candidate_window` facts ranked in memory by a derived value
    fn ranked_page(
        &self,
        base: StoreQuery,
        target: &SetTarget,
        sort: SortMode,
        cursor: Option<&QueryCursor>,
        limit: usize,
    ) -> Result<(Vec<(f64, SetFact)>, bool)> {
        let window = self.caps.candidate_window.max(1);
        let query = base
            .order_by(path(&["performed_at"]), Direction::Desc)
            .limit(window + 1);
        let mut candidates = decode_facts(self.store.query(&query)?)?;
        let approximate = candidates.len() > window;
        if approximate {
            tracing::debug!(
                "Sort {} ranked only the newest {} candidate sets",
                sort,
                window
            );
            candidates.truncate(window);
        }

        let mut ranked: Vec<(f64, SetFact)> = candidates
            .into_iter()
            .filter_map(|fact| sort_value(&fact, target, sort).map(|v| (v, fact)))
            .collect();
        ranked.sort_by(|(va, a), (vb, b)| {
            vb.partial_cmp(va)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.set_id.cmp(&b.set_id))
        });
        if let Some(cursor) = cursor {
            ranked.retain(|(value, fact)| {
                *value < cursor.last_value
                    || (*value == cursor.last_value && fact.set_id > cursor.last_id)
            });
        }
        ranked.truncate(limit + 1);
        Ok((ranked, approximate))
    }

    // ========================================================================
    // Series and progress
    // ========================================================================

    fn load_points(
        &self,
        key: &SeriesKey,
        weeks: u32,
        as_of: Option<NaiveDate>,
    ) -> Result<(Option<String>, Vec<WeekPoint>)> {
        let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
        let span = window(as_of, weeks);
        let (Some(first), Some(last)) = (span.first(), span.last()) else {
            return Ok((None, Vec::new()));
        };
        let Some(series) = SeriesStore::new(self.store.as_ref()).load(key)? else {
            tracing::debug!("No series for {}; returning empty result", key);
            return Ok((None, Vec::new()));
        };
        let points = series
            .buckets_between(*first, *last)
            .into_iter()
            .map(|(week, bucket)| WeekPoint::from_bucket(week, bucket))
            .filter(WeekPoint::has_data)
            .collect();
        Ok((series.exercise_name, points))
    }

    pub fn get_series(&self, req: &SeriesRequest) -> Result<SeriesResponse> {
        let key = self.resolve_series_target(&req.target)?;
        let weeks = self.window_weeks(req.window_weeks)?;
        let (exercise_name, points) = self.load_points(&key, weeks, req.as_of)?;

        let total = points.len();
        let avg = |f: &dyn Fn(&WeekPoint) -> f64| {
            if total == 0 {
                0.0
            } else {
                points.iter().map(f).sum::<f64>() / total as f64
            }
        };
        let summary = SeriesSummary {
            total_weeks: total,
            avg_weekly_sets: avg(&|p: &WeekPoint| p.sets),
            avg_weekly_volume: avg(&|p: &WeekPoint| p.volume_for(key.kind)),
            trend_direction: trend_direction(&points, key.kind),
        };

        Ok(SeriesResponse {
            target: key,
            exercise_name,
            window_weeks: weeks,
            weekly_points: points,
            summary,
        })
    }

    pub fn progress_summary(&self, req: &ProgressRequest) -> Result<ProgressResponse> {
        let key = self.resolve_series_target(&req.target)?;
        let weeks = self.window_weeks(req.window_weeks)?;
        let (exercise_name, points) = self.load_points(&key, weeks, req.as_of)?;

        let top_exercises = match key.kind {
            TargetKind::Exercise => points
                .iter()
                .fold(None, |acc: Option<ExerciseContribution>, p| {
                    let mut c = acc.unwrap_or_else(|| ExerciseContribution {
                        exercise_id: key.id.clone(),
                        exercise_name: exercise_name.clone(),
                        effective_volume: 0.0,
                        sets: 0.0,
                    });
                    c.effective_volume += p.volume;
                    c.sets += p.sets;
                    Some(c)
                })
                .into_iter()
                .collect(),
            _ => self.top_exercises(&key, weeks, req.as_of)?,
        };

        let rep_distribution = req.include_distribution.then(|| {
            points.iter().fold(RepsBuckets::default(), |mut acc, p| {
                acc.merge(&p.reps_bucket);
                acc
            })
        });

        Ok(ProgressResponse {
            flags: detect_flags(&points, key.kind),
            trend_direction: trend_direction(&points, key.kind),
            target: key,
            weekly_points: points,
            top_exercises,
            rep_distribution,
        })
    }

    /// Exercises feeding a muscle or group target, by effective volume
    fn top_exercises(
        &self,
        key: &SeriesKey,
        weeks: u32,
        as_of: Option<NaiveDate>,
    ) -> Result<Vec<ExerciseContribution>> {
        let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
        let span = window(as_of, weeks);
        let (Some(first), Some(last)) = (span.first(), span.last()) else {
            return Ok(Vec::new());
        };
        let query = StoreQuery::new(FACTS_COLLECTION)
            .filter(target_filter(key))
            .filter(Filter::Eq(path(&["is_warmup"]), json!(false)))
            .filter(Filter::Gte(path(&["week_start"]), json!(week_key(*first))))
            .filter(Filter::Lte(path(&["week_start"]), json!(week_key(*last))))
            .order_by(path(&["performed_at"]), Direction::Desc)
            .limit(self.caps.candidate_window.max(1));
        let facts = decode_facts(self.store.query(&query)?)?;

        let mut by_exercise: HashMap<String, ExerciseContribution> = HashMap::new();
        for fact in &facts {
            let weight = fact.weight_for(key.kind, &key.id);
            let entry = by_exercise
                .entry(fact.exercise_id.clone())
                .or_insert_with(|| ExerciseContribution {
                    exercise_id: fact.exercise_id.clone(),
                    exercise_name: fact.exercise_name.clone(),
                    effective_volume: 0.0,
                    sets: 0.0,
                });
            entry.effective_volume += fact.volume * weight;
            entry.sets += weight;
        }

        let mut top: Vec<_> = by_exercise.into_values().collect();
        top.sort_by(|a, b| {
            b.effective_volume
                .partial_cmp(&a.effective_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.exercise_id.cmp(&b.exercise_id))
        });
        top.truncate(self.caps.top_exercises);
        Ok(top)
    }
}

fn sort_value(fact: &SetFact, target: &SetTarget, sort: SortMode) -> Option<f64> {
    match (sort, target) {
        (SortMode::E1rmDesc, _) => fact.e1rm,
        (SortMode::VolumeDesc, SetTarget::Exercises(_)) => Some(fact.volume),
        (SortMode::VolumeDesc, SetTarget::Group(key)) => {
            Some(fact.effective_volume_for(key.kind, &key.id))
        }
        (SortMode::DateAsc | SortMode::DateDesc, _) => Some(ms(fact.performed_at) as f64),
    }
}

fn project(fact: &SetFact, fields: &[&str]) -> Result<Value> {
    let full = serde_json::to_value(fact)?;
    let mut out = Map::new();
    for field in fields {
        let value = match *field {
            "performed_at" => json!(fact.performed_at.to_rfc3339()),
            other => full.get(other).cloned().unwrap_or(Value::Null),
        };
        out.insert(field.to_string(), value);
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_default_catalog;
    use crate::rollup::RollupEngine;
    use crate::store::MemoryStore;
    use crate::{ErrorKind, ExerciseInput, SetInput, WeightUnit, WorkoutInput};
    use chrono::DateTime;

    struct Fixture {
        rollup: RollupEngine,
        query: QueryCapsEngine,
    }

    fn fixture(caps: CapsConfig) -> Fixture {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::default());
        let catalog: Arc<dyn AttributionProvider> = Arc::new(build_default_catalog());
        Fixture {
            rollup: RollupEngine::new(store.clone(), catalog.clone()),
            query: QueryCapsEngine::new(store, catalog, caps),
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn workout(id: &str, ended_at: DateTime<Utc>, exercise: &str, sets: &[(u32, f64)]) -> WorkoutInput {
        WorkoutInput {
            workout_id: id.into(),
            ended_at,
            weight_unit: WeightUnit::Kg,
            exercises: vec![ExerciseInput {
                exercise_id: exercise.into(),
                name: None,
                weight_unit: None,
                sets: sets
                    .iter()
                    .map(|(reps, kg)| SetInput {
                        reps: Some(*reps),
                        weight_kg: Some(*kg),
                        rir: Some(2),
                        ..Default::default()
                    })
                    .collect(),
            }],
        }
    }

    fn bench_request() -> SetQueryRequest {
        SetQueryRequest {
            exercise_ids: vec!["bench_press".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_exactly_one_target_required() {
        let f = fixture(CapsConfig::default());
        let none = SetQueryRequest::default();
        assert_eq!(f.query.query_sets(&none).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let two = SetQueryRequest {
            muscle_group: Some("chest".into()),
            ..bench_request()
        };
        assert_eq!(f.query.query_sets(&two).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let blank = SetQueryRequest {
            muscle: Some("  ".into()),
            ..bench_request()
        };
        assert!(f.query.query_sets(&blank).is_ok());

        let too_many = SetQueryRequest {
            exercise_ids: (0..11).map(|i| format!("e{}", i)).collect(),
            ..Default::default()
        };
        assert!(f.query.query_sets(&too_many).is_err());
    }

    #[test]
    fn test_unknown_sort_is_invalid() {
        let f = fixture(CapsConfig::default());
        let req = SetQueryRequest {
            sort: Some("random".into()),
            ..bench_request()
        };
        assert_eq!(f.query.query_sets(&req).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_limit_clamped_and_has_more() {
        let f = fixture(CapsConfig {
            max_limit: 5,
            ..CapsConfig::default()
        });
        let sets: Vec<_> = (0..6).map(|i| (5, 60.0 + f64::from(i))).collect();
        f.rollup.apply_workout(&workout("w1", at(16, 10), "bench_press", &sets)).unwrap();

        let req = SetQueryRequest {
            limit: Some(10_000),
            ..bench_request()
        };
        let page = f.query.query_sets(&req).unwrap();
        assert_eq!(page.applied_limit, 5);
        assert_eq!(page.items.len(), 5);
        assert!(page.has_more);

        f.rollup.retract_workout("w1").unwrap();
        f.rollup
            .apply_workout(&workout("w2", at(16, 10), "bench_press", &sets[..5]))
            .unwrap();
        let page = f.query.query_sets(&req).unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
        assert_eq!(f.query.clamp_limit(Some(0)), 1);
    }

    #[test]
    fn test_date_pagination_walks_every_set_once() {
        let f = fixture(CapsConfig::default());
        for day in 15..20 {
            let w = workout(&format!("w{}", day), at(day, 9), "bench_press", &[(5, 80.0), (5, 80.0)]);
            f.rollup.apply_workout(&w).unwrap();
        }

        let mut seen = Vec::new();
        let mut req = SetQueryRequest {
            sort: Some("date_asc".into()),
            limit: Some(3),
            ..bench_request()
        };
        loop {
            let page = f.query.query_sets(&req).unwrap();
            seen.extend(page.items.iter().map(|i| i["set_id"].as_str().unwrap().to_string()));
            match page.next_cursor {
                Some(cursor) => req.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(seen.len(), 10);
        let unique: BTreeSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_cursor_from_other_sort_rejected() {
        let f = fixture(CapsConfig::default());
        let sets: Vec<_> = (0..3).map(|i| (5, 60.0 + f64::from(i))).collect();
        f.rollup.apply_workout(&workout("w1", at(16, 10), "bench_press", &sets)).unwrap();

        let first = f
            .query
            .query_sets(&SetQueryRequest {
                sort: Some("e1rm_desc".into()),
                limit: Some(1),
                ..bench_request()
            })
            .unwrap();
        let cursor = first.next_cursor.unwrap();

        let replay = SetQueryRequest {
            sort: Some("date_desc".into()),
            cursor: Some(cursor),
            ..bench_request()
        };
        assert_eq!(f.query.query_sets(&replay).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_value_sort_and_approximate_window() {
        let f = fixture(CapsConfig {
            candidate_window: 4,
            ..CapsConfig::default()
        });
        f.rollup
            .apply_workout(&workout("old", at(8, 10), "bench_press", &[(1, 200.0)]))
            .unwrap();
        let sets: Vec<_> = (0..4).map(|i| (5, 60.0 + f64::from(i) * 10.0)).collect();
        f.rollup.apply_workout(&workout("new", at(16, 10), "bench_press", &sets)).unwrap();

        let page = f
            .query
            .query_sets(&SetQueryRequest {
                sort: Some("e1rm_desc".into()),
                ..bench_request()
            })
            .unwrap();
        assert!(page.approximate);
        let e1rms: Vec<f64> = page.items.iter().map(|i| i["e1rm"].as_f64().unwrap()).collect();
        assert_eq!(e1rms.len(), 4);
        assert!(e1rms.windows(2).all(|w| w[0] >= w[1]));
        // The heavy single fell outside the candidate window
        assert!(e1rms.iter().all(|e| *e < 200.0));
    }

    #[test]
    fn test_group_target_and_projection() {
        let f = fixture(CapsConfig::default());
        f.rollup
            .apply_workout(&workout("w1", at(16, 10), "bench_press", &[(10, 100.0)]))
            .unwrap();
        f.rollup
            .apply_workout(&workout("w2", at(16, 12), "overhead_press", &[(10, 50.0)]))
            .unwrap();

        let page = f
            .query
            .query_sets(&SetQueryRequest {
                muscle_group: Some("Triceps".into()),
                sort: Some("volume_desc".into()),
                fields: vec!["volume".into(), "bogus".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.items.len(), 2);
        // bench: 1000 x 0.3 = 300, overhead press: 500 x 0.3 = 150
        assert_eq!(page.items[0]["volume"].as_f64(), Some(1000.0));
        let keys: Vec<_> = page.items[0].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"set_id".to_string()));
    }

    #[test]
    fn test_response_byte_budget() {
        let f = fixture(CapsConfig {
            max_response_bytes: 300,
            ..CapsConfig::default()
        });
        let sets: Vec<_> = (0..10).map(|_| (5, 60.0)).collect();
        f.rollup.apply_workout(&workout("w1", at(16, 10), "bench_press", &sets)).unwrap();

        let page = f.query.query_sets(&bench_request()).unwrap();
        assert!(page.truncated);
        assert!(page.has_more);
        assert!(!page.items.is_empty() && page.items.len() < 10);
        assert!(page.next_cursor.is_some());
    }

    #[test]
    fn test_date_range_filter() {
        let f = fixture(CapsConfig::default());
        f.rollup.apply_workout(&workout("a", at(15, 23), "bench_press", &[(5, 60.0)])).unwrap();
        f.rollup.apply_workout(&workout("b", at(16, 0), "bench_press", &[(5, 60.0)])).unwrap();

        let page = f
            .query
            .query_sets(&SetQueryRequest {
                from: NaiveDate::from_ymd_opt(2024, 1, 15),
                to: NaiveDate::from_ymd_opt(2024, 1, 15),
                ..bench_request()
            })
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn test_series_window_and_summary() {
        let f = fixture(CapsConfig::default());
        f.rollup.apply_workout(&workout("a", at(8, 10), "bench_press", &[(5, 100.0)])).unwrap();
        f.rollup.apply_workout(&workout("b", at(16, 10), "bench_press", &[(5, 100.0), (5, 100.0)])).unwrap();

        let req = SeriesRequest {
            target: SeriesTarget::ExerciseName("Bench Press".into()),
            window_weeks: Some(4),
            as_of: NaiveDate::from_ymd_opt(2024, 1, 21),
        };
        let series = f.query.get_series(&req).unwrap();
        assert_eq!(series.target.id, "bench_press");
        assert_eq!(series.summary.total_weeks, 2);
        assert_eq!(series.summary.avg_weekly_sets, 1.5);
        assert_eq!(series.summary.avg_weekly_volume, 750.0);
        assert_eq!(series.summary.trend_direction, TrendDirection::Up);

        let bad = SeriesRequest {
            window_weeks: Some(53),
            ..req.clone()
        };
        assert_eq!(f.query.get_series(&bad).unwrap_err().kind(), ErrorKind::InvalidArgument);
        let zero = SeriesRequest {
            window_weeks: Some(0),
            ..req
        };
        assert!(f.query.get_series(&zero).is_err());
    }

    #[test]
    fn test_missing_series_is_empty() {
        let f = fixture(CapsConfig::default());
        let series = f
            .query
            .get_series(&SeriesRequest {
                target: SeriesTarget::Muscle("calves".into()),
                window_weeks: None,
                as_of: None,
            })
            .unwrap();
        assert!(series.weekly_points.is_empty());
        assert_eq!(series.summary.trend_direction, TrendDirection::InsufficientData);
    }

    #[test]
    fn test_progress_summary_for_group() {
        let f = fixture(CapsConfig::default());
        f.rollup.apply_workout(&workout("a", at(8, 10), "bench_press", &[(10, 100.0); 4])).unwrap();
        f.rollup.apply_workout(&workout("b", at(16, 10), "bench_press", &[(10, 100.0); 2])).unwrap();
        f.rollup.apply_workout(&workout("c", at(16, 11), "overhead_press", &[(10, 50.0)])).unwrap();

        let progress = f
            .query
            .progress_summary(&ProgressRequest {
                target: SeriesTarget::MuscleGroup("triceps".into()),
                window_weeks: Some(2),
                include_distribution: true,
                as_of: NaiveDate::from_ymd_opt(2024, 1, 16),
            })
            .unwrap();
        assert_eq!(progress.weekly_points.len(), 2);
        // Triceps-credited volume 1200 -> 750 stays under the deload drop
        assert!(!progress.flags.deload);
        assert_eq!(progress.top_exercises[0].exercise_id, "bench_press");
        assert!((progress.top_exercises[0].effective_volume - 1800.0).abs() < 1e-6);
        assert_eq!(progress.top_exercises[1].exercise_id, "overhead_press");
        assert_eq!(progress.rep_distribution.unwrap().r6_10, 7.0);
    }
}
