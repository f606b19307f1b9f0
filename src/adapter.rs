//! The Row Storage Adapter contract (spec.md §4.2) plus an in-memory
//! reference implementation used as a test double and by the examples in
//! this crate's own test suite.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::row::{ApplyOutcome, PendingOp, Row, RowQuery};

/// One adapter instance is bound to one `(user_id?, namespace)` and backs one
/// local node. Implementations own the durable row table, pending-op log,
/// and key/value metadata store; the LWW rule (spec.md §4.2) must be
/// enforced *inside* `apply_rows`, not by callers.
pub trait RowStorageAdapter: Send + Sync {
    /// The namespace this adapter instance is bound to. Used to reject rows
    /// from other namespaces.
    fn namespace(&self) -> &str;

    fn query(&self, query: &RowQuery) -> SyncResult<Vec<Row>>;

    /// Bulk LWW apply. Returns one outcome per input, in order. Must be
    /// atomic with respect to concurrent `query`/`apply_rows` calls on this
    /// adapter instance.
    fn apply_rows(&self, rows: &[Row]) -> SyncResult<Vec<ApplyOutcome>>;

    fn append_pending(&self, ops: &[PendingOp]) -> SyncResult<()>;

    /// Ascending by sequence, at most `limit`. A durable implementation must
    /// re-expose already-persisted entries in ascending sequence order after
    /// a process restart (spec.md §6).
    fn get_pending(&self, limit: usize) -> SyncResult<Vec<PendingOp>>;

    fn remove_pending_through(&self, seq_inclusive: u64) -> SyncResult<()>;

    fn put_kv(&self, key: &str, value: serde_json::Value) -> SyncResult<()>;
    fn get_kv(&self, key: &str) -> SyncResult<Option<serde_json::Value>>;
    fn delete_kv(&self, key: &str) -> SyncResult<()>;

    /// Highest pending sequence ever appended (including already-removed
    /// entries), used to re-seed the engine's in-process sequence counter
    /// after a restart (spec.md §9 "Ownership of the pending counter").
    fn max_pending_sequence(&self) -> SyncResult<u64>;
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<(String, String), Row>,
    pending: BTreeMap<u64, PendingOp>,
    kv: BTreeMap<String, serde_json::Value>,
    max_pending_seq: u64,
}

/// Reference adapter: an ordered mapping keyed by `(collection_id, id)`
/// guarded by a single mutex. Each `apply_rows` call deep-clones the row
/// table, computes the batch against the clone, then swaps it back in one
/// step — preserving atomicity of the batch against concurrent reads
/// without requiring a cross-store transaction (spec.md §4.2).
pub struct InMemoryAdapter {
    namespace: String,
    inner: Mutex<Inner>,
}

impl InMemoryAdapter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl RowStorageAdapter for InMemoryAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn query(&self, query: &RowQuery) -> SyncResult<Vec<Row>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Row> = inner
            .rows
            .values()
            .filter(|r| r.collection_id == query.collection_id)
            .filter(|r| query.id.as_deref().map_or(true, |id| r.id == id))
            .filter(|r| {
                query
                    .parent_id
                    .as_deref()
                    .map_or(true, |p| r.parent_id.as_deref() == Some(p))
            })
            .filter(|r| query.include_tombstones || !r.tombstone)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn apply_rows(&self, rows: &[Row]) -> SyncResult<Vec<ApplyOutcome>> {
        for row in rows {
            if row.namespace != self.namespace {
                return Err(SyncError::NamespaceMismatch {
                    row: row.namespace.clone(),
                    adapter: self.namespace.clone(),
                });
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let mut working = inner.rows.clone();
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            let key = (row.collection_id.clone(), row.id.clone());
            let incoming_hlc = row.hlc();
            let written = match working.get(&key) {
                None => true,
                Some(existing) => incoming_hlc > existing.hlc(),
            };
            if written {
                working.insert(key, row.clone());
            }
            outcomes.push(ApplyOutcome::from_row(row, written));
        }

        inner.rows = working;
        Ok(outcomes)
    }

    fn append_pending(&self, ops: &[PendingOp]) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for op in ops {
            inner.max_pending_seq = inner.max_pending_seq.max(op.sequence);
            inner.pending.insert(op.sequence, op.clone());
        }
        Ok(())
    }

    fn get_pending(&self, limit: usize) -> SyncResult<Vec<PendingOp>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pending.values().take(limit).cloned().collect())
    }

    fn remove_pending_through(&self, seq_inclusive: u64) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|seq, _| *seq > seq_inclusive);
        Ok(())
    }

    fn put_kv(&self, key: &str, value: serde_json::Value) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.insert(key.to_string(), value);
        Ok(())
    }

    fn get_kv(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.kv.get(key).cloned())
    }

    fn delete_kv(&self, key: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.remove(key);
        Ok(())
    }

    fn max_pending_sequence(&self) -> SyncResult<u64> {
        Ok(self.inner.lock().unwrap().max_pending_seq)
    }
}

/// Convenience used by the engine to look up a row's identity including
/// tombstones, e.g. to preserve `parent_id` across a `put` (spec.md §4.3).
pub fn find_including_tombstones(
    adapter: &dyn RowStorageAdapter,
    collection_id: &str,
    id: &str,
) -> SyncResult<Option<Row>> {
    let rows = adapter.query(&RowQuery {
        collection_id: collection_id.to_string(),
        id: Some(id.to_string()),
        parent_id: None,
        include_tombstones: true,
    })?;
    Ok(rows.into_iter().next())
}
