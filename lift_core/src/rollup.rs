//! Write path: workout completion and deletion.
//!
//! Each call runs strictly in sequence: fact generation, delta
//! aggregation, ledger claim, fact writes, series writes, ledger update. The
//! ledger makes repeated delivery of the same workout a no-op and lets a
//! later call repair a workout whose earlier call died half way.

use crate::catalog::AttributionProvider;
use crate::delta::{aggregate, aggregate_target};
use crate::facts::generate_set_facts;
use crate::ledger::{content_hash, Claim, Ledger, LedgerEntry, LedgerStatus};
use crate::series::{SeriesStore, Sign, WeekBucket};
use crate::store::{path, DocRef, DocumentStore, Filter, StoreQuery, WriteOp};
use crate::week::{week_key, week_start};
use crate::{Error, Result, SeriesKey, SetFact, TargetKind, WorkoutInput};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

pub const FACTS_COLLECTION: &str = "set_facts";

pub fn fact_doc(set_id: &str) -> DocRef {
    DocRef::new(FACTS_COLLECTION, set_id)
}

/// How an apply call was resolved against the ledger
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    /// Same workout content was already applied; nothing written
    AlreadyApplied,
    /// An edited version replaced a previously applied one
    Replaced,
    /// A half-finished earlier call was repaired
    Recovered,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ApplyReport {
    pub workout_id: String,
    pub status: ApplyStatus,
    pub set_facts_written: usize,
    pub week_start: NaiveDate,
    pub series_touched: usize,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetractStatus {
    Retracted,
    /// Buckets were rebuilt from facts instead of decremented
    Repaired,
    NotApplied,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RetractReport {
    pub workout_id: String,
    pub status: RetractStatus,
    pub set_facts_removed: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ReconcileReport {
    pub target: SeriesKey,
    pub week_start: NaiveDate,
    pub facts_scanned: usize,
    /// `None` when the week had neither facts nor a bucket
    pub bucket: Option<WeekBucket>,
}

/// Drives the write path against one store and one attribution source
pub struct RollupEngine {
    store: Arc<dyn DocumentStore>,
    catalog: Arc<dyn AttributionProvider>,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn DocumentStore>, catalog: Arc<dyn AttributionProvider>) -> Self {
        Self { store, catalog }
    }

    fn ledger(&self) -> Ledger<'_> {
        Ledger::new(self.store.as_ref())
    }

    fn series(&self) -> SeriesStore<'_> {
        SeriesStore::new(self.store.as_ref())
    }

    /// Fold a completed workout into facts and series
    pub fn apply_workout(&self, workout: &WorkoutInput) -> Result<ApplyReport> {
        workout.validate()?;
        let invocation = Uuid::new_v4();
        let span = tracing::info_span!(
            "apply_workout",
            workout_id = %workout.workout_id,
            invocation = %invocation
        );
        let _enter = span.enter();

        let hash = content_hash(workout)?;
        let facts = generate_set_facts(workout, self.catalog.as_ref())?;
        let week = week_start(workout.ended_at);
        let deltas = aggregate(&facts, week);
        let entry = LedgerEntry {
            workout_id: workout.workout_id.clone(),
            content_hash: hash.clone(),
            status: LedgerStatus::Pending,
            set_ids: facts.iter().map(|f| f.set_id.clone()).collect(),
            week_start: week,
            targets: deltas.targets().into_iter().collect(),
            updated_at: Utc::now(),
        };

        let mut status = ApplyStatus::Applied;
        match self.ledger().claim(&entry)? {
            Claim::Done(done) => {
                tracing::info!("Workout already applied; skipping");
                return Ok(ApplyReport {
                    workout_id: workout.workout_id.clone(),
                    status: ApplyStatus::AlreadyApplied,
                    set_facts_written: 0,
                    week_start: done.week_start,
                    series_touched: 0,
                });
            }
            Claim::Busy(held) => {
                return Err(Error::internal(format!(
                    "workout {} is being processed by another invocation since {}",
                    held.workout_id, held.updated_at
                )));
            }
            Claim::Acquired(Some(prev)) if prev.status == LedgerStatus::Applied => {
                tracing::info!("Workout was edited; retracting previous version");
                self.retract_applied(prev, Some(&entry))?;
                status = ApplyStatus::Replaced;
            }
            Claim::Acquired(Some(prev)) if prev.status == LedgerStatus::Pending => {
                return self.recover(workout, hash, prev.clone()).or_else(|e| {
                    self.release(&prev)?;
                    Err(e)
                });
            }
            Claim::Acquired(_) => {}
        }

        self.write_facts(&facts)?;
        self.series().apply(&deltas, Sign::Apply)?;
        let series_touched = entry.targets.len();
        self.ledger().record(&entry.with_status(LedgerStatus::Applied))?;

        tracing::info!(
            "Applied {} set facts to {} series for week {}",
            facts.len(),
            series_touched,
            week_key(week)
        );
        Ok(ApplyReport {
            workout_id: workout.workout_id.clone(),
            status,
            set_facts_written: facts.len(),
            week_start: week,
            series_touched,
        })
    }

    /// Remove a deleted workout's facts and invert its series contribution
    pub fn retract_workout(&self, workout_id: &str) -> Result<RetractReport> {
        if workout_id.trim().is_empty() {
            return Err(Error::invalid("workout_id must not be empty"));
        }
        let invocation = Uuid::new_v4();
        let span = tracing::info_span!(
            "retract_workout",
            workout_id = %workout_id,
            invocation = %invocation
        );
        let _enter = span.enter();

        let report = |status: RetractStatus, removed: usize| RetractReport {
            workout_id: workout_id.to_string(),
            status,
            set_facts_removed: removed,
        };

        match self.ledger().claim_retract(workout_id)? {
            Claim::Busy(held) => Err(Error::internal(format!(
                "workout {} is being processed by another invocation since {}",
                workout_id, held.updated_at
            ))),
            Claim::Done(_) => {
                tracing::info!("Workout already retracted");
                Ok(report(RetractStatus::NotApplied, 0))
            }
            Claim::Acquired(Some(entry)) if entry.status == LedgerStatus::Applied => {
                let removed = self.retract_applied(entry, None)?;
                tracing::info!("Retracted {} set facts", removed);
                Ok(report(RetractStatus::Retracted, removed))
            }
            Claim::Acquired(Some(stale)) => {
                tracing::warn!("Workout was left pending; rebuilding its buckets");
                let targets: BTreeSet<SeriesKey> = stale.targets.iter().cloned().collect();
                let weeks = BTreeSet::from([stale.week_start]);
                let removed = match self.repair(workout_id, Some(workout_id), &targets, &weeks) {
                    Ok(removed) => removed,
                    Err(e) => {
                        self.release(&stale)?;
                        return Err(e);
                    }
                };
                self.ledger()
                    .record(&stale.with_status(LedgerStatus::Retracted))?;
                Ok(report(RetractStatus::Repaired, removed))
            }
            Claim::Acquired(None) => {
                let removed =
                    self.repair(workout_id, None, &BTreeSet::new(), &BTreeSet::new())?;
                if removed == 0 {
                    tracing::info!("Workout was never applied");
                    Ok(report(RetractStatus::NotApplied, 0))
                } else {
                    tracing::warn!("Removed {} unledgered set facts", removed);
                    Ok(report(RetractStatus::Repaired, removed))
                }
            }
        }
    }

    /// Inverse delta for a fully applied workout, then delete its facts
    ///
    /// The ledger ends `Retracted`, or pending on `next` when a new version
    /// of the workout takes over.
    fn retract_applied(&self, entry: LedgerEntry, next: Option<&LedgerEntry>) -> Result<usize> {
        // A crash from here on leaves the entry pending, so the next call repairs
        let entry = entry.with_status(LedgerStatus::Pending);
        self.ledger().record(&entry)?;

        let facts = self.facts_for_workout(&entry.workout_id)?;
        let deltas = aggregate(&facts, entry.week_start);
        self.series().apply(&deltas, Sign::Retract)?;
        let removed = self.delete_facts(&facts)?;

        let done = match next {
            Some(next) => next.clone().with_status(LedgerStatus::Pending),
            None => entry.with_status(LedgerStatus::Retracted),
        };
        self.ledger().record(&done)?;
        Ok(removed)
    }

    /// Finish a workout whose previous call stopped while pending
    fn recover(
        &self,
        workout: &WorkoutInput,
        hash: String,
        stale: LedgerEntry,
    ) -> Result<ApplyReport> {
        tracing::warn!(
            "Workout was left pending at {}; rebuilding from facts",
            stale.updated_at
        );

        let facts = generate_set_facts(workout, self.catalog.as_ref())?;
        let week = week_start(workout.ended_at);
        let deltas = aggregate(&facts, week);

        let mut targets: BTreeSet<SeriesKey> = stale.targets.iter().cloned().collect();
        targets.extend(deltas.targets());
        let weeks = BTreeSet::from([stale.week_start, week]);
        let owner = Some(workout.workout_id.as_str());
        self.ensure_quiet(&targets, &weeks, owner)?;

        let removed = self.delete_facts(&self.facts_for_workout(&workout.workout_id)?)?;
        self.write_facts(&facts)?;
        for week in &weeks {
            for target in &targets {
                self.reconcile_for(target, *week, owner)?;
            }
        }

        let entry = LedgerEntry {
            workout_id: workout.workout_id.clone(),
            content_hash: hash,
            status: LedgerStatus::Applied,
            set_ids: facts.iter().map(|f| f.set_id.clone()).collect(),
            week_start: week,
            targets: deltas.targets().into_iter().collect(),
            updated_at: Utc::now(),
        };
        self.ledger().record(&entry)?;

        tracing::info!(
            "Recovered workout: replaced {} stale facts with {}, rebuilt {} buckets",
            removed,
            facts.len(),
            targets.len() * weeks.len()
        );
        Ok(ApplyReport {
            workout_id: workout.workout_id.clone(),
            status: ApplyStatus::Recovered,
            set_facts_written: facts.len(),
            week_start: week,
            series_touched: targets.len(),
        })
    }

    /// Delete a workout's stored facts and rebuild every bucket they fed
    ///
    /// `owner` is set when the caller holds the workout's ledger lease.
    fn repair(
        &self,
        workout_id: &str,
        owner: Option<&str>,
        targets: &BTreeSet<SeriesKey>,
        weeks: &BTreeSet<NaiveDate>,
    ) -> Result<usize> {
        let facts = self.facts_for_workout(workout_id)?;
        let mut targets = targets.clone();
        let mut weeks = weeks.clone();
        for fact in &facts {
            weeks.insert(fact.week_start);
        }
        for week in &weeks {
            targets.extend(aggregate(&facts, *week).targets());
        }

        self.ensure_quiet(&targets, &weeks, owner)?;
        let removed = self.delete_facts(&facts)?;
        for week in &weeks {
            for target in &targets {
                self.reconcile_for(target, *week, owner)?;
            }
        }
        Ok(removed)
    }

    /// Fail with a retryable error while another workout feeding any of
    /// these buckets is mid-flight
    fn ensure_quiet(
        &self,
        targets: &BTreeSet<SeriesKey>,
        weeks: &BTreeSet<NaiveDate>,
        owner: Option<&str>,
    ) -> Result<()> {
        for week in weeks {
            for target in targets {
                if let Some(held) = self.ledger().in_flight(target, *week, owner)?.first() {
                    return Err(Error::internal(format!(
                        "{} week {} has workout {} in flight since {}; retry later",
                        target,
                        week_key(*week),
                        held.workout_id,
                        held.updated_at
                    )));
                }
            }
        }
        Ok(())
    }

    /// Hand a claimed entry back unchanged so the next call can take it over
    fn release(&self, previous: &LedgerEntry) -> Result<()> {
        tracing::info!("Releasing workout {} until its buckets are quiet", previous.workout_id);
        self.ledger().record(previous)
    }

    fn write_facts(&self, facts: &[SetFact]) -> Result<()> {
        let ops = facts
            .iter()
            .map(|fact| -> Result<WriteOp> {
                Ok(WriteOp::Put {
                    doc: fact_doc(&fact.set_id),
                    value: serde_json::to_value(fact)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        for chunk in ops.chunks(self.store.max_batch_ops()) {
            self.store.commit(chunk)?;
        }
        Ok(())
    }

    fn delete_facts(&self, facts: &[SetFact]) -> Result<usize> {
        let ops: Vec<_> = facts
            .iter()
            .map(|fact| WriteOp::Delete {
                doc: fact_doc(&fact.set_id),
            })
            .collect();
        for chunk in ops.chunks(self.store.max_batch_ops()) {
            self.store.commit(chunk)?;
        }
        Ok(ops.len())
    }

    /// Stored facts of one workout, in logged order
    pub fn facts_for_workout(&self, workout_id: &str) -> Result<Vec<SetFact>> {
        let query = StoreQuery::new(FACTS_COLLECTION)
            .filter(Filter::Eq(path(&["workout_id"]), json!(workout_id)));
        let mut facts = decode_facts(self.store.query(&query)?)?;
        facts.sort_by(|a, b| {
            a.exercise_id
                .cmp(&b.exercise_id)
                .then(a.set_index.cmp(&b.set_index))
        });
        Ok(facts)
    }

    /// Rebuild one bucket from the raw facts of that week
    ///
    /// Refuses with a retryable error while any workout feeding the bucket
    /// holds a pending lease, since its facts and increments may disagree.
    pub fn reconcile(&self, target: &SeriesKey, week: NaiveDate) -> Result<ReconcileReport> {
        self.reconcile_for(target, week, None)
    }

    fn reconcile_for(
        &self,
        target: &SeriesKey,
        week: NaiveDate,
        owner: Option<&str>,
    ) -> Result<ReconcileReport> {
        let targets = BTreeSet::from([target.clone()]);
        let weeks = BTreeSet::from([week]);
        self.ensure_quiet(&targets, &weeks, owner)?;
        let query = StoreQuery::new(FACTS_COLLECTION)
            .filter(Filter::Eq(path(&["week_start"]), json!(week_key(week))))
            .filter(target_filter(target));
        let facts = decode_facts(self.store.query(&query)?)?;
        // A claim landing during the scan would otherwise be counted twice
        self.ensure_quiet(&targets, &weeks, owner)?;
        let record = aggregate_target(&facts, target.kind, &target.id);

        let series = self.series();
        let bucket = match record {
            Some(record) => WeekBucket::from(&record),
            None => {
                let has_bucket = series
                    .load(target)?
                    .is_some_and(|s| s.weeks.contains_key(&week_key(week)));
                if !has_bucket {
                    return Ok(ReconcileReport {
                        target: target.clone(),
                        week_start: week,
                        facts_scanned: facts.len(),
                        bucket: None,
                    });
                }
                WeekBucket::default()
            }
        };

        let name = facts.iter().find_map(|f| f.exercise_name.as_deref());
        let name = (target.kind == TargetKind::Exercise).then_some(name).flatten();
        series.replace_bucket(target, week, &bucket, name)?;
        tracing::debug!(
            "Reconciled {} week {} from {} facts",
            target,
            week_key(week),
            facts.len()
        );
        Ok(ReconcileReport {
            target: target.clone(),
            week_start: week,
            facts_scanned: facts.len(),
            bucket: Some(bucket),
        })
    }

    /// Drop a target's whole series
    pub fn purge(&self, target: &SeriesKey) -> Result<bool> {
        self.series().purge(target)
    }
}

/// Store filter selecting facts that feed a target
pub(crate) fn target_filter(target: &SeriesKey) -> Filter {
    match target.kind {
        TargetKind::Exercise => Filter::Eq(path(&["exercise_id"]), json!(target.id)),
        TargetKind::MuscleGroup => Filter::Gt(
            path(&["muscle_group_contrib", target.id.as_str()]),
            json!(0.0),
        ),
        TargetKind::Muscle => Filter::Gt(path(&["muscle_contrib", target.id.as_str()]), json!(0.0)),
    }
}

pub(crate) fn decode_facts(docs: Vec<crate::store::Document>) -> Result<Vec<SetFact>> {
    docs.into_iter()
        .map(|doc| {
            serde_json::from_value(doc.data)
                .map_err(|e| Error::internal(format!("corrupt set fact {}: {}", doc.id, e)))
        })
        .collect()
}
