//! Processed-workout ledger.
//!
//! Series increments are not idempotent, so every apply and retract is
//! recorded here keyed by workout id. An entry left `Pending` means an
//! earlier invocation died between its first and last write; the next
//! invocation for that workout repairs the affected buckets by rescanning
//! facts instead of incrementing again. A pending entry younger than
//! [`PENDING_LEASE_SECS`] belongs to a live invocation and is left alone.

use crate::store::{path, DocRef, DocumentStore, Filter, StoreQuery, TxOutcome, WriteOp};
use crate::week::week_key;
use crate::{Error, Result, SeriesKey, WorkoutInput};
use serde_json::{json, Value};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const LEDGER_COLLECTION: &str = "rollup_ledger";

/// How long a pending entry is owned by the invocation that wrote it
pub const PENDING_LEASE_SECS: i64 = 300;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Applied,
    Retracted,
}

/// What the engine last did for one workout
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub workout_id: String,
    pub content_hash: String,
    pub status: LedgerStatus,
    #[serde(default)]
    pub set_ids: Vec<String>,
    pub week_start: NaiveDate,
    /// Every series the workout's facts feed
    #[serde(default)]
    pub targets: Vec<SeriesKey>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn with_status(mut self, status: LedgerStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }

    /// Pending and still inside its lease at `now`
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.status == LedgerStatus::Pending
            && now - self.updated_at < Duration::seconds(PENDING_LEASE_SECS)
    }
}

/// Result of trying to take ownership of a workout
#[derive(Clone, Debug, PartialEq)]
pub enum Claim {
    /// The caller owns the workout now; carries the entry that was there before
    Acquired(Option<LedgerEntry>),
    /// Nothing left to do: the same content is applied, or the workout is
    /// already retracted
    Done(LedgerEntry),
    /// Another invocation is mid-flight on this workout
    Busy(LedgerEntry),
}

/// Hex sha256 of the workout's JSON form
pub fn content_hash(workout: &WorkoutInput) -> Result<String> {
    let bytes = serde_json::to_vec(workout)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn ledger_doc(workout_id: &str) -> DocRef {
    DocRef::new(LEDGER_COLLECTION, workout_id)
}

fn decode_entry(workout_id: &str, value: &Value) -> Result<LedgerEntry> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::internal(format!("corrupt ledger entry for {}: {}", workout_id, e)))
}

/// Typed access to the ledger collection
pub struct Ledger<'a> {
    store: &'a dyn DocumentStore,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    pub fn get(&self, workout_id: &str) -> Result<Option<LedgerEntry>> {
        let Some(value) = self.store.get(&ledger_doc(workout_id))? else {
            return Ok(None);
        };
        decode_entry(workout_id, &value).map(Some)
    }

    pub fn record(&self, entry: &LedgerEntry) -> Result<()> {
        self.store.commit(&[WriteOp::Put {
            doc: ledger_doc(&entry.workout_id),
            value: serde_json::to_value(entry)?,
        }])?;
        tracing::debug!(
            "Ledger: workout {} is now {:?}",
            entry.workout_id,
            entry.status
        );
        Ok(())
    }

    /// Atomically mark a workout pending before any series mutation
    ///
    /// A fresh workout gets `pending` written as-is. An applied entry with
    /// different content is re-marked pending in its old form, so a crash
    /// while retracting it still knows which buckets to rebuild. A stale
    /// pending entry is taken over by refreshing its timestamp.
    pub fn claim(&self, pending: &LedgerEntry) -> Result<Claim> {
        let now = Utc::now();
        let mut claim = Claim::Acquired(None);
        self.store
            .transact(&ledger_doc(&pending.workout_id), &mut |current| {
                let current = current
                    .map(|value| decode_entry(&pending.workout_id, value))
                    .transpose()?;

                let write = match &current {
                    Some(entry) if entry.is_held(now) => {
                        claim = Claim::Busy(entry.clone());
                        return Ok(TxOutcome::Abort);
                    }
                    Some(entry)
                        if entry.status == LedgerStatus::Applied
                            && entry.content_hash == pending.content_hash =>
                    {
                        claim = Claim::Done(entry.clone());
                        return Ok(TxOutcome::Abort);
                    }
                    Some(entry) if entry.status != LedgerStatus::Retracted => {
                        entry.clone().with_status(LedgerStatus::Pending)
                    }
                    _ => pending.clone(),
                };
                claim = Claim::Acquired(current);
                Ok(TxOutcome::Write(serde_json::to_value(&write)?))
            })?;
        Ok(claim)
    }

    /// Atomically take an applied workout for retraction
    ///
    /// An applied or stale pending entry is re-marked pending in place. A
    /// retracted entry is `Done`. A missing entry is acquired without
    /// writing anything, since there is nothing to lease.
    pub fn claim_retract(&self, workout_id: &str) -> Result<Claim> {
        let now = Utc::now();
        let mut claim = Claim::Acquired(None);
        self.store
            .transact(&ledger_doc(workout_id), &mut |current| {
                let Some(current) = current.map(|v| decode_entry(workout_id, v)).transpose()?
                else {
                    claim = Claim::Acquired(None);
                    return Ok(TxOutcome::Abort);
                };
                if current.is_held(now) {
                    claim = Claim::Busy(current);
                    return Ok(TxOutcome::Abort);
                }
                if current.status == LedgerStatus::Retracted {
                    claim = Claim::Done(current);
                    return Ok(TxOutcome::Abort);
                }
                let write = current.clone().with_status(LedgerStatus::Pending);
                claim = Claim::Acquired(Some(current));
                Ok(TxOutcome::Write(serde_json::to_value(&write)?))
            })?;
        Ok(claim)
    }

    /// Live pending entries feeding `target` in `week`, other than `owner`
    pub fn in_flight(
        &self,
        target: &SeriesKey,
        week: NaiveDate,
        owner: Option<&str>,
    ) -> Result<Vec<LedgerEntry>> {
        let now = Utc::now();
        let query = StoreQuery::new(LEDGER_COLLECTION)
            .filter(Filter::Eq(path(&["status"]), json!("pending")))
            .filter(Filter::Eq(path(&["week_start"]), json!(week_key(week))));
        let mut held = Vec::new();
        for doc in self.store.query(&query)? {
            let entry = decode_entry(&doc.id, &doc.data)?;
            if Some(entry.workout_id.as_str()) != owner
                && entry.is_held(now)
                && entry.targets.contains(target)
            {
                held.push(entry);
            }
        }
        Ok(held)
    }
}
