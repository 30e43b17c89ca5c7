//! Key-addressed document store.
//!
//! The rollup engine talks to persistence only through [`DocumentStore`]:
//! get, batched writes with atomic numeric increments, simple ordered
//! queries and read-modify-write transactions. [`MemoryStore`] is the
//! in-process implementation; see `file_store` for the on-disk one.

use crate::{Error, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

/// Address of one document
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

impl DocRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Nested field path inside a document
pub type FieldPath = Vec<String>;

/// Build a field path from string segments
pub fn path<S: AsRef<str>>(segments: &[S]) -> FieldPath {
    segments.iter().map(|s| s.as_ref().to_string()).collect()
}

/// One operation of an atomic write batch
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Replace the whole document
    Put { doc: DocRef, value: Value },
    /// Remove the document if present
    Delete { doc: DocRef },
    /// Add `by` to a numeric field, creating the document and parents lazily
    Increment { doc: DocRef, field: FieldPath, by: f64 },
    /// Set a field only when it is absent
    SetDefault {
        doc: DocRef,
        field: FieldPath,
        value: Value,
    },
}

impl WriteOp {
    pub fn doc(&self) -> &DocRef {
        match self {
            WriteOp::Put { doc, .. }
            | WriteOp::Delete { doc }
            | WriteOp::Increment { doc, .. }
            | WriteOp::SetDefault { doc, .. } => doc,
        }
    }
}

/// Query predicate on a (possibly nested) field
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(FieldPath, Value),
    In(FieldPath, Vec<Value>),
    Gt(FieldPath, Value),
    Gte(FieldPath, Value),
    Lte(FieldPath, Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Native single-field ordering; ties break on document id ascending
#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoreQuery {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    /// Resume strictly after this (order value, document id)
    pub start_after: Option<(Value, String)>,
    pub limit: Option<usize>,
}

impl StoreQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            start_after: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.order_by = Some(OrderBy { field, direction });
        self
    }

    pub fn start_after(mut self, value: Value, id: impl Into<String>) -> Self {
        self.start_after = Some((value, id.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A document returned by a query
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// Decision taken by a transaction body
#[derive(Clone, Debug, PartialEq)]
pub enum TxOutcome {
    Write(Value),
    Delete,
    /// Nothing to change
    Abort,
}

/// Body of a read-modify-write transaction; may run more than once
pub type TxBody<'a> = dyn FnMut(Option<&Value>) -> Result<TxOutcome> + 'a;

/// Persistent document store used by the rollup engine
pub trait DocumentStore: Send + Sync {
    fn get(&self, doc: &DocRef) -> Result<Option<Value>>;

    /// Apply a batch atomically; batches above `max_batch_ops` are rejected
    fn commit(&self, ops: &[WriteOp]) -> Result<()>;

    fn query(&self, query: &StoreQuery) -> Result<Vec<Document>>;

    /// Read-modify-write one document, retrying on conflicting writers
    fn transact(&self, doc: &DocRef, body: &mut TxBody<'_>) -> Result<()>;

    fn max_batch_ops(&self) -> usize;
}

// ============================================================================
// Shared document helpers
// ============================================================================

/// Read a nested field
pub fn field_get<'a>(value: &'a Value, field: &[String]) -> Option<&'a Value> {
    field
        .iter()
        .try_fold(value, |current, segment| current.get(segment))
}

/// Mutable handle to a nested field's parent object, creating objects on the way
fn parent_object<'a>(value: &'a mut Value, field: &[String]) -> Result<&'a mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let mut current = value;
    for segment in &field[..field.len().saturating_sub(1)] {
        let map = current
            .as_object_mut()
            .ok_or_else(|| Error::internal(format!("field '{}' is not an object", segment)))?;
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !current.is_object() {
            return Err(Error::internal(format!(
                "field '{}' is not an object",
                segment
            )));
        }
    }
    current
        .as_object_mut()
        .ok_or_else(|| Error::internal("document root is not an object"))
}

/// Overwrite a nested field
pub fn field_set(value: &mut Value, field: &[String], new_value: Value) -> Result<()> {
    let leaf = field
        .last()
        .ok_or_else(|| Error::internal("empty field path"))?;
    parent_object(value, field)?.insert(leaf.clone(), new_value);
    Ok(())
}

fn field_increment(value: &mut Value, field: &[String], by: f64) -> Result<()> {
    let leaf = field
        .last()
        .ok_or_else(|| Error::internal("empty field path"))?;
    let parent = parent_object(value, field)?;
    let current = match parent.get(leaf) {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(other) => {
            return Err(Error::internal(format!(
                "cannot increment non-numeric field '{}': {}",
                leaf, other
            )))
        }
    };
    parent.insert(leaf.clone(), number(current + by));
    Ok(())
}

/// JSON number from a float (non-finite values become null)
pub fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Apply one write to a document slot (`None` means absent)
pub(crate) fn apply_op(slot: &mut Option<Value>, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::Put { value, .. } => *slot = Some(value.clone()),
        WriteOp::Delete { .. } => *slot = None,
        WriteOp::Increment { field, by, .. } => {
            let doc = slot.get_or_insert_with(|| Value::Object(Map::new()));
            field_increment(doc, field, *by)?;
        }
        WriteOp::SetDefault { field, value, .. } => {
            let doc = slot.get_or_insert_with(|| Value::Object(Map::new()));
            if field_get(doc, field).map_or(true, Value::is_null) {
                field_set(doc, field, value.clone())?;
            }
        }
    }
    Ok(())
}

/// Total order over JSON scalars: null < bool < number < string
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

/// Whether a document satisfies one filter; missing fields never match
pub fn matches_filter(data: &Value, filter: &Filter) -> bool {
    let check = |field: &FieldPath, pred: &dyn Fn(&Value) -> bool| {
        field_get(data, field).map_or(false, pred)
    };
    match filter {
        Filter::Eq(field, expected) => check(field, &|v: &Value| {
            compare_values(v, expected) == Ordering::Equal && same_type(v, expected)
        }),
        Filter::In(field, options) => check(field, &|v: &Value| {
            options
                .iter()
                .any(|o| same_type(v, o) && compare_values(v, o) == Ordering::Equal)
        }),
        Filter::Gt(field, bound) => check(field, &|v: &Value| {
            same_type(v, bound) && compare_values(v, bound) == Ordering::Greater
        }),
        Filter::Gte(field, bound) => check(field, &|v: &Value| {
            same_type(v, bound) && compare_values(v, bound) != Ordering::Less
        }),
        Filter::Lte(field, bound) => check(field, &|v: &Value| {
            same_type(v, bound) && compare_values(v, bound) != Ordering::Greater
        }),
    }
}

/// Evaluate a query over an iterator of (id, document)
pub(crate) fn run_query<'a, I>(docs: I, query: &StoreQuery) -> Vec<Document>
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut selected: Vec<(&String, &Value)> = docs
        .into_iter()
        .filter(|(_, data)| query.filters.iter().all(|f| matches_filter(data, f)))
        .collect();

    if let Some(order) = &query.order_by {
        // Documents without the ordering field are not part of an ordered result
        selected.retain(|(_, data)| field_get(data, &order.field).is_some());

        let key_cmp = |a: (&Value, &str), b: (&Value, &str)| {
            let by_value = compare_values(a.0, b.0);
            let by_value = match order.direction {
                Direction::Asc => by_value,
                Direction::Desc => by_value.reverse(),
            };
            by_value.then_with(|| a.1.cmp(b.1))
        };

        selected.sort_by(|(id_a, a), (id_b, b)| {
            let va = field_get(a, &order.field).unwrap_or(&Value::Null);
            let vb = field_get(b, &order.field).unwrap_or(&Value::Null);
            key_cmp((va, id_a.as_str()), (vb, id_b.as_str()))
        });

        if let Some((after_value, after_id)) = &query.start_after {
            selected.retain(|(id, data)| {
                let v = field_get(data, &order.field).unwrap_or(&Value::Null);
                key_cmp((v, id.as_str()), (after_value, after_id.as_str())) == Ordering::Greater
            });
        }
    } else {
        selected.sort_by(|(a, _), (b, _)| a.cmp(b));
        if let Some((_, after_id)) = &query.start_after {
            selected.retain(|(id, _)| id.as_str() > after_id.as_str());
        }
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    selected
        .into_iter()
        .take(limit)
        .map(|(id, data)| Document {
            id: id.clone(),
            data: data.clone(),
        })
        .collect()
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Clone, Debug)]
struct Versioned {
    version: u64,
    data: Value,
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: HashMap<String, BTreeMap<String, Versioned>>,
    next_version: u64,
}

impl MemoryInner {
    fn version_of(&self, doc: &DocRef) -> u64 {
        self.collections
            .get(&doc.collection)
            .and_then(|c| c.get(&doc.id))
            .map_or(0, |v| v.version)
    }

    fn write(&mut self, doc: &DocRef, value: Option<Value>) {
        self.next_version += 1;
        let version = self.next_version;
        let collection = self.collections.entry(doc.collection.clone()).or_default();
        match value {
            Some(data) => {
                collection.insert(doc.id.clone(), Versioned { version, data });
            }
            None => {
                collection.remove(&doc.id);
            }
        }
    }
}

/// In-process store with optimistic, versioned transactions
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_batch_ops: usize,
    max_attempts: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(500, 5)
    }
}

impl MemoryStore {
    pub fn new(max_batch_ops: usize, max_attempts: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            max_batch_ops: max_batch_ops.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::internal("memory store lock poisoned"))
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len))
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, doc: &DocRef) -> Result<Option<Value>> {
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(&doc.collection)
            .and_then(|c| c.get(&doc.id))
            .map(|v| v.data.clone()))
    }

    fn commit(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.len() > self.max_batch_ops {
            return Err(Error::internal(format!(
                "batch of {} ops exceeds limit of {}",
                ops.len(),
                self.max_batch_ops
            )));
        }

        let mut inner = self.lock()?;

        // Stage every touched document first so a failing op leaves nothing applied
        let mut staged: BTreeMap<DocRef, Option<Value>> = BTreeMap::new();
        for op in ops {
            let doc = op.doc();
            if !staged.contains_key(doc) {
                let current = inner
                    .collections
                    .get(&doc.collection)
                    .and_then(|c| c.get(&doc.id))
                    .map(|v| v.data.clone());
                staged.insert(doc.clone(), current);
            }
            if let Some(slot) = staged.get_mut(doc) {
                apply_op(slot, op)?;
            }
        }

        for (doc, value) in staged {
            inner.write(&doc, value);
        }
        Ok(())
    }

    fn query(&self, query: &StoreQuery) -> Result<Vec<Document>> {
        let inner = self.lock()?;
        let Some(collection) = inner.collections.get(&query.collection) else {
            return Ok(Vec::new());
        };
        Ok(run_query(
            collection.iter().map(|(id, v)| (id, &v.data)),
            query,
        ))
    }

    fn transact(&self, doc: &DocRef, body: &mut TxBody<'_>) -> Result<()> {
        for attempt in 1..=self.max_attempts {
            let (snapshot, version) = {
                let inner = self.lock()?;
                let snapshot = inner
                    .collections
                    .get(&doc.collection)
                    .and_then(|c| c.get(&doc.id))
                    .map(|v| v.data.clone());
                (snapshot, inner.version_of(doc))
            };

            let outcome = body(snapshot.as_ref())?;

            let mut inner = self.lock()?;
            if inner.version_of(doc) != version {
                tracing::debug!(
                    "Transaction on {} conflicted (attempt {}/{})",
                    doc,
                    attempt,
                    self.max_attempts
                );
                continue;
            }
            match outcome {
                TxOutcome::Write(value) => inner.write(doc, Some(value)),
                TxOutcome::Delete => inner.write(doc, None),
                TxOutcome::Abort => {}
            }
            return Ok(());
        }

        Err(Error::internal(format!(
            "transaction on {} exhausted {} attempts",
            doc, self.max_attempts
        )))
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}
