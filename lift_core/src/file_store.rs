//! On-disk document store with file locking.
//!
//! Each collection is a directory and each document a JSON file inside it.
//! A single lock file serializes writers across processes: readers take a
//! shared lock, batches and transactions an exclusive one. Documents are
//! replaced atomically by writing a temp file and renaming it over the old
//! one.
//!
//! A batch is staged in full before the first rename, so a failing op
//! writes nothing and no other caller sees a partial batch. Atomicity across
//! documents ends there: a crash while the renames run can leave a prefix
//! of the batch on disk. Callers that need more lean on the rollup ledger,
//! which keeps the workout pending until every batch has landed.

use crate::store::{apply_op, run_query, DocRef, Document, DocumentStore, StoreQuery, TxBody, TxOutcome, WriteOp};
use crate::{Error, Result};
use fs2::FileExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const LOCK_FILE: &str = ".lock";
const DOC_EXTENSION: &str = "json";

/// Encode a document id as a safe file stem (`%XX` for anything unusual)
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Lock guard released on drop
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release store lock: {}", e);
        }
    }
}

/// Directory-backed store shared safely between processes
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    max_batch_ops: usize,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>, max_batch_ops: usize) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::debug!("Opened file store at {:?}", root);
        Ok(Self {
            root,
            max_batch_ops: max_batch_ops.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(StoreLock { file })
    }

    fn doc_path(&self, doc: &DocRef) -> PathBuf {
        self.root
            .join(encode_id(&doc.collection))
            .join(format!("{}.{}", encode_id(&doc.id), DOC_EXTENSION))
    }

    fn read_doc(&self, doc: &DocRef) -> Result<Option<Value>> {
        let path = self.doc_path(doc);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&contents).map_err(|e| {
            Error::internal(format!("corrupt document {:?}: {}", path, e))
        })?;
        Ok(Some(value))
    }

    fn write_doc(&self, doc: &DocRef, value: &Value) -> Result<()> {
        let path = self.doc_path(doc);
        let parent = path
            .parent()
            .ok_or_else(|| Error::internal("document path missing parent"))?;
        std::fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file_mut());
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn remove_doc(&self, doc: &DocRef) -> Result<()> {
        match std::fs::remove_file(self.doc_path(doc)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn store_slot(&self, doc: &DocRef, value: Option<&Value>) -> Result<()> {
        match value {
            Some(value) => self.write_doc(doc, value),
            None => self.remove_doc(doc),
        }
    }

    fn read_collection(&self, collection: &str) -> Result<BTreeMap<String, Value>> {
        let dir = self.root.join(encode_id(collection));
        let mut docs = BTreeMap::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(docs),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != DOC_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_id)
            else {
                tracing::warn!("Skipping unreadable document name {:?}", path);
                continue;
            };
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&contents) {
                Ok(value) => {
                    docs.insert(id, value);
                }
                Err(e) => {
                    tracing::warn!("Skipping corrupt document {:?}: {}", path, e);
                }
            }
        }
        Ok(docs)
    }
}

impl DocumentStore for FileStore {
    fn get(&self, doc: &DocRef) -> Result<Option<Value>> {
        let _lock = self.lock(false)?;
        self.read_doc(doc)
    }

    fn commit(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.len() > self.max_batch_ops {
            return Err(Error::internal(format!(
                "batch of {} ops exceeds limit of {}",
                ops.len(),
                self.max_batch_ops
            )));
        }

        let _lock = self.lock(true)?;

        let mut staged: BTreeMap<DocRef, Option<Value>> = BTreeMap::new();
        for op in ops {
            let doc = op.doc();
            if !staged.contains_key(doc) {
                let current = self.read_doc(doc)?;
                staged.insert(doc.clone(), current);
            }
            if let Some(slot) = staged.get_mut(doc) {
                apply_op(slot, op)?;
            }
        }

        // Per-document renames; see the module note on crashes
        for (doc, value) in &staged {
            self.store_slot(doc, value.as_ref())?;
        }
        tracing::trace!("Committed {} ops over {} documents", ops.len(), staged.len());
        Ok(())
    }

    fn query(&self, query: &StoreQuery) -> Result<Vec<Document>> {
        let _lock = self.lock(false)?;
        let docs = self.read_collection(&query.collection)?;
        Ok(run_query(docs.iter(), query))
    }

    fn transact(&self, doc: &DocRef, body: &mut TxBody<'_>) -> Result<()> {
        // The exclusive lock is held across read and write, so no retry is needed
        let _lock = self.lock(true)?;
        let current = self.read_doc(doc)?;
        match body(current.as_ref())? {
            TxOutcome::Write(value) => self.write_doc(doc, &value),
            TxOutcome::Delete => self.remove_doc(doc),
            TxOutcome::Abort => Ok(()),
        }
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{path, Direction, Filter};
    use serde_json::json;

    #[test]
    fn test_id_encoding_roundtrip() {
        for id in ["plain_id", "exercise__bench-press", "a/b c.d", "ünïcode%"] {
            let encoded = encode_id(id);
            assert!(!encoded.contains('/'));
            assert_eq!(decode_id(&encoded).as_deref(), Some(id));
        }
    }

    #[test]
    fn test_put_get_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path().join("store"), 500).unwrap();
        let doc = DocRef::new("facts", "abc");

        store
            .commit(&[WriteOp::Put {
                doc: doc.clone(),
                value: json!({"reps": 5}),
            }])
            .unwrap();
        assert_eq!(store.get(&doc).unwrap(), Some(json!({"reps": 5})));

        store.commit(&[WriteOp::Delete { doc: doc.clone() }]).unwrap();
        assert_eq!(store.get(&doc).unwrap(), None);
    }

    #[test]
    fn test_increments_persist_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("store");
        let doc = DocRef::new("weekly_series", "exercise__bench_press");

        for _ in 0..3 {
            let store = FileStore::open(&root, 500).unwrap();
            store
                .commit(&[WriteOp::Increment {
                    doc: doc.clone(),
                    field: path(&["weeks", "2024-01-15", "sets"]),
                    by: 1.0,
                }])
                .unwrap();
        }

        let store = FileStore::open(&root, 500).unwrap();
        let value = store.get(&doc).unwrap().unwrap();
        assert_eq!(value["weeks"]["2024-01-15"]["sets"], json!(3.0));
    }

    #[test]
    fn test_query_reads_collection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path(), 500).unwrap();
        let ops: Vec<_> = (0..5)
            .map(|i| WriteOp::Put {
                doc: DocRef::new("facts", format!("f{}", i)),
                value: json!({"at": i * 10, "warmup": i == 0}),
            })
            .collect();
        store.commit(&ops).unwrap();

        let q = StoreQuery::new("facts")
            .filter(Filter::Eq(path(&["warmup"]), json!(false)))
            .order_by(path(&["at"]), Direction::Desc)
            .limit(2);
        let ids: Vec<_> = store.query(&q).unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["f4", "f3"]);
    }

    #[test]
    fn test_transaction_writes_and_aborts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path(), 500).unwrap();
        let doc = DocRef::new("series", "x");

        store
            .transact(&doc, &mut |current| {
                assert!(current.is_none());
                Ok(TxOutcome::Write(json!({"max": 100.0})))
            })
            .unwrap();
        store
            .transact(&doc, &mut |_| Ok(TxOutcome::Abort))
            .unwrap();
        assert_eq!(store.get(&doc).unwrap(), Some(json!({"max": 100.0})));
    }

    #[test]
    fn test_failing_op_writes_no_document() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path().join("store"), 500).unwrap();
        let label = DocRef::new("c", "a");
        store
            .commit(&[WriteOp::Put {
                doc: label.clone(),
                value: json!({"label": "text"}),
            }])
            .unwrap();

        let fresh = DocRef::new("c", "b");
        let result = store.commit(&[
            WriteOp::Increment {
                doc: fresh.clone(),
                field: path(&["n"]),
                by: 1.0,
            },
            WriteOp::Increment {
                doc: label.clone(),
                field: path(&["label"]),
                by: 1.0,
            },
        ]);
        assert!(result.is_err());
        assert_eq!(store.get(&fresh).unwrap(), None);
        assert_eq!(store.get(&label).unwrap(), Some(json!({"label": "text"})));
    }

    #[test]
    fn test_no_stray_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path(), 500).unwrap();
        store
            .commit(&[WriteOp::Put {
                doc: DocRef::new("facts", "one"),
                value: json!({}),
            }])
            .unwrap();

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path().join("facts"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "one.json")
            .collect();
        assert!(
            extras.is_empty(),
            "Expected only one.json, found extras: {:?}",
            extras
        );
    }
}
