//! The uniform row envelope ("bag of rows") and the small value types built
//! on top of it: pending operations, apply outcomes, the sync cursor, and
//! invalidation hints. See spec.md §3.

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;

/// One row in the bag. Identity is `(namespace, collection_id, id)` (I1).
/// `data` is `None` iff `tombstone` is `true`.
///
/// Field names on the wire are camelCase per spec.md §6's canonical Row JSON
/// shape, bit-identical across push, pull, and server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub namespace: String,
    pub collection_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub data: Option<serde_json::Value>,
    pub tombstone: bool,
    pub tx_id: Option<String>,
    pub schema_version: Option<i64>,
    pub committed_timestamp_ms: Option<i64>,
    pub hlc_timestamp_ms: i64,
    pub hlc_counter: u64,
    pub hlc_device_id: String,
}

impl Row {
    /// Extracts the HLC triple carried by this row.
    pub fn hlc(&self) -> Hlc {
        Hlc {
            wall_ms: self.hlc_timestamp_ms,
            counter: self.hlc_counter,
            device_id: self.hlc_device_id.clone(),
        }
    }

    pub fn identity(&self) -> RowIdentity {
        RowIdentity {
            namespace: self.namespace.clone(),
            collection_id: self.collection_id.clone(),
            id: self.id.clone(),
        }
    }
}

/// The identity key rows are partitioned and replaced by (I1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowIdentity {
    pub namespace: String,
    pub collection_id: String,
    pub id: String,
}

/// Filter accepted by `RowStorageAdapter::query`.
#[derive(Debug, Clone, Default)]
pub struct RowQuery {
    pub collection_id: String,
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub include_tombstones: bool,
}

impl RowQuery {
    pub fn by_collection(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ..Default::default()
        }
    }
}

/// The payload of a pending local write awaiting acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PendingOpKind {
    Put { data: serde_json::Value },
    Delete,
}

/// A local write recorded in the pending-operation log, ordered by a
/// strictly monotonic `sequence` (I3) that is never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    pub sequence: u64,
    pub namespace: String,
    pub collection_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub kind: PendingOpKind,
    pub hlc_timestamp_ms: i64,
    pub hlc_counter: u64,
    pub hlc_device_id: String,
    pub tx_id: Option<String>,
    pub schema_version: Option<i64>,
}

impl PendingOp {
    pub fn hlc(&self) -> Hlc {
        Hlc {
            wall_ms: self.hlc_timestamp_ms,
            counter: self.hlc_counter,
            device_id: self.hlc_device_id.clone(),
        }
    }
}

/// Per-row result of a bulk `apply_rows` call, reported in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub namespace: String,
    pub collection_id: String,
    pub id: String,
    pub hlc_timestamp_ms: i64,
    pub hlc_counter: u64,
    pub hlc_device_id: String,
    pub tombstone: bool,
    pub committed_timestamp_ms: Option<i64>,
    /// Whether this incoming row won LWW and replaced the stored row.
    pub written: bool,
}

impl ApplyOutcome {
    pub fn from_row(row: &Row, written: bool) -> Self {
        Self {
            namespace: row.namespace.clone(),
            collection_id: row.collection_id.clone(),
            id: row.id.clone(),
            hlc_timestamp_ms: row.hlc_timestamp_ms,
            hlc_counter: row.hlc_counter,
            hlc_device_id: row.hlc_device_id.clone(),
            tombstone: row.tombstone,
            committed_timestamp_ms: row.committed_timestamp_ms,
            written,
        }
    }
}

/// `(committed_timestamp_ms, collection_id, id)`, totally ordered
/// lexicographically in that field order (field declaration order drives
/// the derived `Ord`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub committed_timestamp_ms: i64,
    pub collection_id: String,
    pub id: String,
}

/// Summary of an affected query shape, emitted after writes so caches can
/// refresh. Deduplicated per emission by `(collection_id, id, parent_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvalidationHint {
    pub collection_id: String,
    pub id: Option<String>,
    pub parent_id: Option<String>,
}

impl InvalidationHint {
    pub fn from_row(row: &Row) -> Self {
        Self {
            collection_id: row.collection_id.clone(),
            id: Some(row.id.clone()),
            parent_id: row.parent_id.clone(),
        }
    }
}

/// Whether a `ChangeEvent` originated from a local write or a remote apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

/// Emitted to engine subscribers after a successful apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub source: ChangeSource,
    pub invalidation_hints: Vec<InvalidationHint>,
}

/// Outcome of one write through the Storage Engine's public API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub namespace: String,
    pub collection_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub tombstone: bool,
    pub committed_timestamp_ms: Option<i64>,
    pub hlc_timestamp_ms: i64,
    pub hlc_counter: u64,
    pub hlc_device_id: String,
    pub applied: bool,
}

/// Options accepted by `StorageEngine::put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Tri-state: `None` means "preserve whatever parent_id the existing row
    /// has"; `Some(None)` is an explicit clear; `Some(Some(x))` sets it.
    pub parent_id: Option<Option<String>>,
    pub tx_id: Option<String>,
    pub schema_version: Option<i64>,
    /// Overrides the wall-clock reading used to mint this write's HLC.
    /// `None` uses the system clock (spec.md §4.1); callers inject a fixed
    /// value to make HLC output deterministic in tests.
    pub now_ms: Option<i64>,
}

/// One intent in a `StorageEngine::batch_local` call.
#[derive(Debug, Clone)]
pub enum AtomicOp {
    Put {
        collection_id: String,
        id: String,
        data: serde_json::Value,
        options: PutOptions,
    },
    Delete {
        collection_id: String,
        id: String,
    },
}
