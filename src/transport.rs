//! The Transport Adapter contract (spec.md §4.5): the wire-format-agnostic
//! interface the Sync Loop pushes pending ops through and pulls remote
//! changes from. Concrete wire transports (HTTP, websocket, ...) are out of
//! scope here; this module defines the contract plus an in-memory reference
//! used by the sync loop's own tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::SyncResult;
use crate::row::{PendingOp, Row, SyncCursor};

/// One push request: a contiguous slice of the local pending-op log.
/// `namespace` mirrors the optional field on the reference HTTP binding's
/// request body (spec.md §6); a transport bound to a single namespace may
/// ignore it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PushRequest {
    pub ops: Vec<PendingOp>,
    pub namespace: Option<String>,
}

/// Acknowledgement of a push: the highest sequence number the server has
/// durably recorded (spec.md §4.5 "Push"). `None` when the server could not
/// durably record anything from this push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushAck {
    pub acked_through_sequence: Option<u64>,
}

/// One pull request: resume from a cursor, or from the beginning if `None`.
/// `collection_id`/`parent_id`/`namespace` narrow the page to a scope, per
/// the query parameters on the reference HTTP binding (spec.md §6); the Sync
/// Loop itself always passes `None` for all three and pulls the whole
/// namespace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PullRequest {
    pub cursor: Option<SyncCursor>,
    pub limit: usize,
    pub collection_id: Option<String>,
    pub parent_id: Option<String>,
    pub namespace: Option<String>,
}

/// Response to a pull: rows in ascending cursor order, plus the cursor to
/// resume from next time and whether more pages remain (spec.md §4.5
/// "Pull").
#[derive(Debug, Clone, PartialEq)]
pub struct PullResponse {
    pub rows: Vec<Row>,
    pub next_cursor: Option<SyncCursor>,
    pub has_more: bool,
}

/// Out-of-band events a transport can push to the Sync Loop without being
/// asked (spec.md §4.5 "Server-pushed events").
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server pushed changes directly; the loop applies them without
    /// waiting for the next scheduled pull.
    ServerChanges { changes: Vec<Row> },
    /// The current credentials were rejected; the loop must stop retrying
    /// until the connection manager reports a new state.
    NeedsAuth,
}

/// Handle returned by `TransportAdapter::on_event`; dropping it does nothing,
/// the listener stays registered until `unsubscribe` is called explicitly
/// (spec.md §4.5 "`on_event(listener) -> unsubscribe`").
pub struct EventSubscription {
    cancel: Box<dyn FnOnce() + Send>,
}

impl EventSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

/// Wire-format-agnostic contract a concrete transport (HTTP, websocket,
/// ...) implements. The Sync Loop holds this as `Arc<dyn TransportAdapter>`
/// and never depends on a specific wire protocol.
pub trait TransportAdapter: Send + Sync {
    fn push(&self, request: PushRequest) -> SyncResult<PushAck>;
    fn pull(&self, request: PullRequest) -> SyncResult<PullResponse>;

    /// Subscribes to server-pushed events. Implementations call `on_event`
    /// from any thread for as long as the transport is connected. The
    /// returned subscription must be unsubscribed to stop delivery
    /// (spec.md §4.5, §4.6 "`stop()` unsubscribes both").
    fn on_event(
        &self,
        on_event: Arc<dyn Fn(TransportEvent) + Send + Sync>,
    ) -> EventSubscription;
}

#[derive(Default)]
struct Inner {
    rows: Vec<Row>,
    acked_through: u64,
    fail_push: bool,
    fail_pull: bool,
    needs_auth: bool,
}

type EventListeners = Arc<Mutex<HashMap<u64, Arc<dyn Fn(TransportEvent) + Send + Sync>>>>;

/// Reference in-memory transport: "the server" is just a `Vec<Row>` of
/// already-committed rows, with pushes appended under their own committed
/// timestamp counter. Used by the sync loop's tests, not shipped as a real
/// wire transport (spec.md explicitly puts wire transports out of scope).
pub struct InMemoryTransport {
    inner: Mutex<Inner>,
    listeners: EventListeners,
    next_listener_id: AtomicU64,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds the server-side row set directly, as if another device had
    /// already pushed these rows.
    pub fn seed_remote_rows(&self, rows: Vec<Row>) {
        self.inner.lock().unwrap().rows.extend(rows);
    }

    pub fn set_fail_push(&self, fail: bool) {
        self.inner.lock().unwrap().fail_push = fail;
    }

    pub fn set_fail_pull(&self, fail: bool) {
        self.inner.lock().unwrap().fail_pull = fail;
    }

    pub fn set_needs_auth(&self, needs_auth: bool) {
        self.inner.lock().unwrap().needs_auth = needs_auth;
    }

    pub fn emit(&self, event: TransportEvent) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
        for cb in listeners {
            cb(event.clone());
        }
    }
}

impl TransportAdapter for InMemoryTransport {
    fn push(&self, request: PushRequest) -> SyncResult<PushAck> {
        let mut inner = self.inner.lock().unwrap();
        if inner.needs_auth {
            return Err(crate::error::SyncError::Unauthorized);
        }
        if inner.fail_push {
            return Err(crate::error::SyncError::TransportError {
                status: 503,
                body: "push unavailable".into(),
            });
        }

        let mut max_seq = inner.acked_through;
        for op in &request.ops {
            let committed_ts = inner.rows.len() as i64 + 1;
            let row = crate::row::Row {
                namespace: op.namespace.clone(),
                collection_id: op.collection_id.clone(),
                id: op.id.clone(),
                parent_id: op.parent_id.clone(),
                data: match &op.kind {
                    crate::row::PendingOpKind::Put { data } => Some(data.clone()),
                    crate::row::PendingOpKind::Delete => None,
                },
                tombstone: matches!(op.kind, crate::row::PendingOpKind::Delete),
                tx_id: op.tx_id.clone(),
                schema_version: op.schema_version,
                committed_timestamp_ms: Some(committed_ts),
                hlc_timestamp_ms: op.hlc_timestamp_ms,
                hlc_counter: op.hlc_counter,
                hlc_device_id: op.hlc_device_id.clone(),
            };
            inner.rows.push(row);
            max_seq = max_seq.max(op.sequence);
        }
        inner.acked_through = max_seq;

        Ok(PushAck {
            acked_through_sequence: Some(inner.acked_through),
        })
    }

    fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        let inner = self.inner.lock().unwrap();
        if inner.needs_auth {
            return Err(crate::error::SyncError::Unauthorized);
        }
        if inner.fail_pull {
            return Err(crate::error::SyncError::TransportError {
                status: 503,
                body: "pull unavailable".into(),
            });
        }

        let mut candidates: Vec<&Row> = inner
            .rows
            .iter()
            .filter(|row| {
                request.cursor.as_ref().map_or(true, |cursor| {
                    let row_cursor = SyncCursor {
                        committed_timestamp_ms: row.committed_timestamp_ms.unwrap_or(0),
                        collection_id: row.collection_id.clone(),
                        id: row.id.clone(),
                    };
                    row_cursor > *cursor
                })
            })
            .filter(|row| {
                request
                    .collection_id
                    .as_deref()
                    .map_or(true, |c| row.collection_id == c)
            })
            .filter(|row| {
                request
                    .parent_id
                    .as_deref()
                    .map_or(true, |p| row.parent_id.as_deref() == Some(p))
            })
            .collect();
        candidates.sort_by_key(|row| {
            (
                row.committed_timestamp_ms.unwrap_or(0),
                row.collection_id.clone(),
                row.id.clone(),
            )
        });

        let limit = if request.limit == 0 {
            candidates.len()
        } else {
            request.limit
        };
        let has_more = candidates.len() > limit;
        let page: Vec<Row> = candidates.into_iter().take(limit).cloned().collect();
        let next_cursor = page.last().map(|row| SyncCursor {
            committed_timestamp_ms: row.committed_timestamp_ms.unwrap_or(0),
            collection_id: row.collection_id.clone(),
            id: row.id.clone(),
        });

        Ok(PullResponse {
            rows: page,
            next_cursor,
            has_more,
        })
    }

    fn on_event(
        &self,
        on_event: Arc<dyn Fn(TransportEvent) + Send + Sync>,
    ) -> EventSubscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().insert(id, on_event);
        let listeners = Arc::clone(&self.listeners);
        EventSubscription::new(move || {
            listeners.lock().unwrap().remove(&id);
        })
    }
}
