//! The Storage Engine: the only write path exposed to the app (spec.md
//! §4.3). Resolves operation-level intents the adapter does not know about,
//! allocates HLCs in one batch outside any adapter transaction, invokes the
//! adapter's LWW apply once, appends pending entries for writes that
//! actually won LWW, and emits deduplicated invalidation hints.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::adapter::{find_including_tombstones, RowStorageAdapter};
use crate::error::SyncResult;
use crate::hlc::HlcClock;
use crate::row::{
    AtomicOp, ChangeEvent, ChangeSource, InvalidationHint, PendingOp, PendingOpKind, PutOptions,
    Row, RowQuery, WriteResult,
};

/// Result of `StorageEngine::apply_remote`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRemoteResult {
    pub applied_count: usize,
    pub invalidation_hints: Vec<InvalidationHint>,
}

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    listeners: std::collections::HashMap<u64, Listener>,
}

/// A fully resolved write intent, ready to be turned into a row once an HLC
/// has been allocated for it.
struct ResolvedIntent {
    collection_id: String,
    id: String,
    parent_id: Option<String>,
    tombstone: bool,
    data: Option<serde_json::Value>,
    tx_id: Option<String>,
    schema_version: Option<i64>,
}

/// Handle returned by `StorageEngine::subscribe`. Holds only a weak
/// reference back to the engine so unsubscribing after the engine itself is
/// dropped is a harmless no-op (spec.md §9 "Listeners without cycles").
pub struct Unsubscribe {
    engine: Weak<StorageEngine>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.subscribers.lock().unwrap().listeners.remove(&self.id);
        }
    }
}

pub struct StorageEngine {
    adapter: Arc<dyn RowStorageAdapter>,
    hlc: Arc<dyn HlcClock>,
    next_pending_seq: AtomicU64,
    subscribers: Mutex<Subscribers>,
    /// Guards intent resolution + HLC allocation + apply + pending append +
    /// event emit as one atomic step, so no other engine operation
    /// (including reads) can interleave (spec.md §4.3 "Serialization").
    queue: Mutex<()>,
}

impl StorageEngine {
    pub fn new(adapter: Arc<dyn RowStorageAdapter>, hlc: Arc<dyn HlcClock>) -> SyncResult<Self> {
        let seeded_from = adapter.max_pending_sequence()?;
        Ok(Self {
            adapter,
            hlc,
            next_pending_seq: AtomicU64::new(seeded_from + 1),
            subscribers: Mutex::new(Subscribers::default()),
            queue: Mutex::new(()),
        })
    }

    pub fn adapter(&self) -> &Arc<dyn RowStorageAdapter> {
        &self.adapter
    }

    // ---- reads (tombstone-filtered) ----

    pub fn get(&self, collection_id: &str, id: &str) -> SyncResult<Option<Row>> {
        let _guard = self.queue.lock().unwrap();
        let rows = self.adapter.query(&RowQuery {
            collection_id: collection_id.to_string(),
            id: Some(id.to_string()),
            parent_id: None,
            include_tombstones: false,
        })?;
        Ok(rows.into_iter().next())
    }

    pub fn get_all(&self, collection_id: &str) -> SyncResult<Vec<Row>> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.query(&RowQuery::by_collection(collection_id))
    }

    pub fn get_all_with_parent(
        &self,
        collection_id: &str,
        parent_id: &str,
    ) -> SyncResult<Vec<Row>> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.query(&RowQuery {
            collection_id: collection_id.to_string(),
            id: None,
            parent_id: Some(parent_id.to_string()),
            include_tombstones: false,
        })
    }

    // ---- writes ----

    pub fn put(
        &self,
        collection_id: &str,
        id: &str,
        data: serde_json::Value,
        options: PutOptions,
    ) -> SyncResult<WriteResult> {
        let _guard = self.queue.lock().unwrap();
        let now_ms = options.now_ms;
        let intent = self.resolve_put_intent(collection_id, id, data, options)?;
        let mut results = self.apply_intents_locked(vec![intent], now_ms)?;
        Ok(results.remove(0))
    }

    pub fn delete(
        &self,
        collection_id: &str,
        id: &str,
        now_ms: Option<i64>,
    ) -> SyncResult<WriteResult> {
        let _guard = self.queue.lock().unwrap();
        let intent = self.resolve_delete_intent(collection_id, id)?;
        let mut results = self.apply_intents_locked(vec![intent], now_ms)?;
        Ok(results.remove(0))
    }

    pub fn delete_all_with_parent(
        &self,
        collection_id: &str,
        parent_id: &str,
        now_ms: Option<i64>,
    ) -> SyncResult<Vec<WriteResult>> {
        let _guard = self.queue.lock().unwrap();
        let rows = self.adapter.query(&RowQuery {
            collection_id: collection_id.to_string(),
            id: None,
            parent_id: Some(parent_id.to_string()),
            include_tombstones: false,
        })?;
        let intents = rows
            .into_iter()
            .map(|row| ResolvedIntent {
                collection_id: row.collection_id,
                id: row.id,
                parent_id: row.parent_id,
                tombstone: true,
                data: None,
                tx_id: None,
                schema_version: None,
            })
            .collect();
        self.apply_intents_locked(intents, now_ms)
    }

    /// Ordered sequence of put/delete intents applied as one HLC batch and
    /// one `apply_rows` call. `now_ms` overrides the wall clock for the
    /// whole batch; per-op `PutOptions::now_ms` is ignored here since a
    /// batch allocates HLCs from a single `next_batch` call.
    pub fn batch_local(
        &self,
        ops: Vec<AtomicOp>,
        now_ms: Option<i64>,
    ) -> SyncResult<Vec<WriteResult>> {
        let _guard = self.queue.lock().unwrap();
        let mut intents = Vec::with_capacity(ops.len());
        for op in ops {
            let intent = match op {
                AtomicOp::Put {
                    collection_id,
                    id,
                    data,
                    options,
                } => self.resolve_put_intent(&collection_id, &id, data, options)?,
                AtomicOp::Delete { collection_id, id } => {
                    self.resolve_delete_intent(&collection_id, &id)?
                }
            };
            intents.push(intent);
        }
        self.apply_intents_locked(intents, now_ms)
    }

    /// Rows already carry server HLCs; no allocation happens here.
    pub fn apply_remote(&self, rows: &[Row]) -> SyncResult<ApplyRemoteResult> {
        let _guard = self.queue.lock().unwrap();
        let outcomes = self.adapter.apply_rows(rows)?;
        let mut applied_count = 0;
        let mut hints = Vec::new();
        for (row, outcome) in rows.iter().zip(outcomes.iter()) {
            if outcome.written {
                applied_count += 1;
                hints.push(InvalidationHint::from_row(row));
            }
        }
        let hints = dedup_hints(hints);
        if !hints.is_empty() {
            self.emit(ChangeEvent {
                source: ChangeSource::Remote,
                invalidation_hints: hints.clone(),
            });
        }
        Ok(ApplyRemoteResult {
            applied_count,
            invalidation_hints: hints,
        })
    }

    // ---- pending log / kv passthrough ----

    pub fn get_pending(&self, limit: usize) -> SyncResult<Vec<PendingOp>> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.get_pending(limit)
    }

    pub fn remove_pending_through(&self, seq_inclusive: u64) -> SyncResult<()> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.remove_pending_through(seq_inclusive)
    }

    pub fn put_kv(&self, key: &str, value: serde_json::Value) -> SyncResult<()> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.put_kv(key, value)
    }

    pub fn get_kv(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.get_kv(key)
    }

    pub fn delete_kv(&self, key: &str) -> SyncResult<()> {
        let _guard = self.queue.lock().unwrap();
        self.adapter.delete_kv(key)
    }

    // ---- subscriptions ----

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let mut subs = self.subscribers.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.listeners.insert(id, Arc::new(listener));
        Unsubscribe {
            engine: Arc::downgrade(self),
            id,
        }
    }

    // ---- internals ----

    fn resolve_put_intent(
        &self,
        collection_id: &str,
        id: &str,
        data: serde_json::Value,
        options: PutOptions,
    ) -> SyncResult<ResolvedIntent> {
        let parent_id = match options.parent_id {
            Some(explicit) => explicit,
            None => find_including_tombstones(self.adapter.as_ref(), collection_id, id)?
                .and_then(|row| row.parent_id),
        };
        Ok(ResolvedIntent {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
            parent_id,
            tombstone: false,
            data: Some(data),
            tx_id: options.tx_id,
            schema_version: options.schema_version,
        })
    }

    fn resolve_delete_intent(
        &self,
        collection_id: &str,
        id: &str,
    ) -> SyncResult<ResolvedIntent> {
        let parent_id = find_including_tombstones(self.adapter.as_ref(), collection_id, id)?
            .and_then(|row| row.parent_id);
        Ok(ResolvedIntent {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
            parent_id,
            tombstone: true,
            data: None,
            tx_id: None,
            schema_version: None,
        })
    }

    /// Allocates one HLC batch for `intents`, applies them in one call, and
    /// appends exactly one pending entry per row that actually won LWW.
    /// Caller must already hold `self.queue`.
    fn apply_intents_locked(
        &self,
        intents: Vec<ResolvedIntent>,
        now_ms: Option<i64>,
    ) -> SyncResult<Vec<WriteResult>> {
        if intents.is_empty() {
            return Ok(Vec::new());
        }

        let namespace = self.adapter.namespace().to_string();
        let hlcs = self.hlc.next_batch(intents.len(), now_ms)?;
        let rows: Vec<Row> = intents
            .iter()
            .zip(hlcs.iter())
            .map(|(intent, hlc)| Row {
                namespace: namespace.clone(),
                collection_id: intent.collection_id.clone(),
                id: intent.id.clone(),
                parent_id: intent.parent_id.clone(),
                data: intent.data.clone(),
                tombstone: intent.tombstone,
                tx_id: intent.tx_id.clone(),
                schema_version: intent.schema_version,
                committed_timestamp_ms: None,
                hlc_timestamp_ms: hlc.wall_ms,
                hlc_counter: hlc.counter,
                hlc_device_id: hlc.device_id.clone(),
            })
            .collect();

        let outcomes = self.adapter.apply_rows(&rows)?;

        let mut pending_ops = Vec::new();
        let mut hints = Vec::new();
        let mut results = Vec::with_capacity(rows.len());

        for (row, outcome) in rows.iter().zip(outcomes.iter()) {
            if outcome.written {
                let sequence = self.next_pending_seq.fetch_add(1, Ordering::SeqCst);
                pending_ops.push(PendingOp {
                    sequence,
                    namespace: row.namespace.clone(),
                    collection_id: row.collection_id.clone(),
                    id: row.id.clone(),
                    parent_id: row.parent_id.clone(),
                    kind: if row.tombstone {
                        PendingOpKind::Delete
                    } else {
                        PendingOpKind::Put {
                            data: row.data.clone().unwrap_or(serde_json::Value::Null),
                        }
                    },
                    hlc_timestamp_ms: row.hlc_timestamp_ms,
                    hlc_counter: row.hlc_counter,
                    hlc_device_id: row.hlc_device_id.clone(),
                    tx_id: row.tx_id.clone(),
                    schema_version: row.schema_version,
                });
                hints.push(InvalidationHint::from_row(row));
            }
            results.push(WriteResult {
                namespace: row.namespace.clone(),
                collection_id: row.collection_id.clone(),
                id: row.id.clone(),
                parent_id: row.parent_id.clone(),
                tombstone: row.tombstone,
                committed_timestamp_ms: row.committed_timestamp_ms,
                hlc_timestamp_ms: row.hlc_timestamp_ms,
                hlc_counter: row.hlc_counter,
                hlc_device_id: row.hlc_device_id.clone(),
                applied: outcome.written,
            });
        }

        if !pending_ops.is_empty() {
            self.adapter.append_pending(&pending_ops)?;
        }

        let hints = dedup_hints(hints);
        if !hints.is_empty() {
            self.emit(ChangeEvent {
                source: ChangeSource::Local,
                invalidation_hints: hints,
            });
        }

        Ok(results)
    }

    fn emit(&self, event: ChangeEvent) {
        let listeners: Vec<Listener> = {
            let subs = self.subscribers.lock().unwrap();
            subs.listeners.values().cloned().collect()
        };
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!("storage engine listener panicked; other listeners still ran");
            }
        }
    }
}

fn dedup_hints(hints: Vec<InvalidationHint>) -> Vec<InvalidationHint> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(hints.len());
    for hint in hints {
        if seen.insert(hint.clone()) {
            out.push(hint);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryAdapter;
    use crate::hlc::HlcService;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> Arc<StorageEngine> {
        let adapter = Arc::new(InMemoryAdapter::new("ns"));
        let hlc = Arc::new(HlcService::new("deviceA").unwrap());
        Arc::new(StorageEngine::new(adapter, hlc).unwrap())
    }

    #[test]
    fn single_put_get() {
        let engine = engine();
        let result = engine
            .put(
                "books",
                "b1",
                serde_json::json!({ "title": "Dune" }),
                PutOptions::default(),
            )
            .unwrap();
        assert!(result.applied);
        assert_eq!(result.hlc_counter, 0);

        let row = engine.get("books", "b1").unwrap().unwrap();
        assert_eq!(row.data, Some(serde_json::json!({ "title": "Dune" })));
    }

    #[test]
    fn put_honors_injected_now_ms() {
        let engine = engine();
        let result = engine
            .put(
                "books",
                "b1",
                serde_json::json!({ "title": "Dune" }),
                PutOptions {
                    now_ms: Some(1000),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(result.hlc_timestamp_ms, 1000);
        assert_eq!(result.hlc_counter, 0);
        assert!(result.applied);
    }

    #[test]
    fn stale_write_does_not_append_pending() {
        let adapter = Arc::new(InMemoryAdapter::new("ns"));
        adapter
            .apply_rows(&[Row {
                namespace: "ns".into(),
                collection_id: "books".into(),
                id: "b1".into(),
                parent_id: None,
                data: Some(serde_json::json!({ "title": "Dune" })),
                tombstone: false,
                tx_id: None,
                schema_version: None,
                committed_timestamp_ms: None,
                hlc_timestamp_ms: 9000,
                hlc_counter: 0,
                hlc_device_id: "deviceZ".into(),
            }])
            .unwrap();
        let hlc = Arc::new(HlcService::new("deviceA").unwrap());
        let engine = Arc::new(StorageEngine::new(adapter, hlc).unwrap());

        let result = engine
            .put(
                "books",
                "b1",
                serde_json::json!({ "title": "stale" }),
                PutOptions::default(),
            )
            .unwrap();
        assert!(!result.applied);
        assert!(engine.get_pending(10).unwrap().is_empty());
        let row = engine.get("books", "b1").unwrap().unwrap();
        assert_eq!(row.data, Some(serde_json::json!({ "title": "Dune" })));
    }

    #[test]
    fn batch_local_same_row_advances_counter_both_applied() {
        let engine = engine();
        let ops = vec![
            AtomicOp::Put {
                collection_id: "books".into(),
                id: "b1".into(),
                data: serde_json::json!({ "v": 1 }),
                options: PutOptions::default(),
            },
            AtomicOp::Put {
                collection_id: "books".into(),
                id: "b1".into(),
                data: serde_json::json!({ "v": 2 }),
                options: PutOptions::default(),
            },
        ];
        let results = engine.batch_local(ops, None).unwrap();
        assert!(results[0].applied);
        assert!(results[1].applied);
        assert_eq!(results[0].hlc_counter + 1, results[1].hlc_counter);
    }

    #[test]
    fn delete_then_get_hides_row_until_greater_hlc_put() {
        let engine = engine();
        engine
            .put(
                "books",
                "b1",
                serde_json::json!({ "title": "Dune" }),
                PutOptions::default(),
            )
            .unwrap();
        engine.delete("books", "b1", None).unwrap();
        assert!(engine.get("books", "b1").unwrap().is_none());
        assert!(engine.get_all("books").unwrap().is_empty());

        engine
            .put(
                "books",
                "b1",
                serde_json::json!({ "title": "Dune 2" }),
                PutOptions::default(),
            )
            .unwrap();
        assert!(engine.get("books", "b1").unwrap().is_some());
    }

    #[test]
    fn put_preserves_parent_id_when_omitted_and_clears_on_explicit_null() {
        let engine = engine();
        engine
            .put(
                "highlights",
                "h1",
                serde_json::json!({}),
                PutOptions {
                    parent_id: Some(Some("b1".into())),
                    ..Default::default()
                },
            )
            .unwrap();

        let updated = engine
            .put(
                "highlights",
                "h1",
                serde_json::json!({ "note": "x" }),
                PutOptions::default(),
            )
            .unwrap();
        assert_eq!(updated.parent_id, Some("b1".into()));

        let cleared = engine
            .put(
                "highlights",
                "h1",
                serde_json::json!({ "note": "y" }),
                PutOptions {
                    parent_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cleared.parent_id, None);
    }

    #[test]
    fn delete_all_with_parent_scopes_to_matching_rows() {
        let engine = engine();
        for (id, parent) in [("h1", "b1"), ("h2", "b1"), ("h3", "b2")] {
            engine
                .put(
                    "highlights",
                    id,
                    serde_json::json!({}),
                    PutOptions {
                        parent_id: Some(Some(parent.into())),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let results = engine
            .delete_all_with_parent("highlights", "b1", None)
            .unwrap();
        assert_eq!(results.len(), 2);
        let remaining = engine.get_all("highlights").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "h3");
    }

    #[test]
    fn apply_remote_idempotent_exactly_one_write_across_two_calls() {
        let engine = engine();
        let row = Row {
            namespace: "ns".into(),
            collection_id: "books".into(),
            id: "b1".into(),
            parent_id: None,
            data: Some(serde_json::json!({ "title": "Dune" })),
            tombstone: false,
            tx_id: None,
            schema_version: None,
            committed_timestamp_ms: Some(1),
            hlc_timestamp_ms: 1000,
            hlc_counter: 0,
            hlc_device_id: "deviceZ".into(),
        };
        let first = engine.apply_remote(&[row.clone()]).unwrap();
        let second = engine.apply_remote(&[row]).unwrap();
        assert_eq!(first.applied_count + second.applied_count, 1);
    }

    #[test]
    fn subscribers_receive_dedup_hints_and_survive_panics() {
        let engine = engine();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let _unsub_panicking = engine.subscribe(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });
        let seen_hints = Arc::new(Mutex::new(Vec::new()));
        let seen_hints2 = seen_hints.clone();
        let _unsub = engine.subscribe(move |event| {
            seen_hints2.lock().unwrap().push(event.invalidation_hints.len());
        });

        engine
            .put("books", "b1", serde_json::json!({}), PutOptions::default())
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*seen_hints.lock().unwrap(), vec![1]);
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        let engine = engine();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let unsub = engine.subscribe(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        engine
            .put("books", "b1", serde_json::json!({}), PutOptions::default())
            .unwrap();
        unsub.unsubscribe();
        engine
            .put("books", "b2", serde_json::json!({}), PutOptions::default())
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_counter_reseeds_from_adapter_after_restart() {
        let adapter = Arc::new(InMemoryAdapter::new("ns"));
        let hlc = Arc::new(HlcService::new("deviceA").unwrap());
        let engine = Arc::new(StorageEngine::new(adapter.clone(), hlc.clone()).unwrap());
        engine
            .put("books", "b1", serde_json::json!({}), PutOptions::default())
            .unwrap();
        engine
            .put("books", "b2", serde_json::json!({}), PutOptions::default())
            .unwrap();
        let max_seq = adapter.max_pending_sequence().unwrap();
        assert_eq!(max_seq, 2);

        // Simulate process restart: new engine bound to the same adapter.
        let hlc2 = Arc::new(HlcService::new("deviceA").unwrap());
        let restarted = StorageEngine::new(adapter.clone(), hlc2).unwrap();
        let result = restarted
            .put("books", "b3", serde_json::json!({}), PutOptions::default())
            .unwrap();
        assert!(result.applied);
        let pending = restarted.get_pending(10).unwrap();
        assert!(pending.iter().all(|p| p.sequence > max_seq));
    }
}
