//! Hybrid Logical Clock service.
//!
//! Produces HLC triples that are strictly monotonic under concurrent callers
//! and merges remote observations. See spec.md §4.1.

use std::cmp::Ordering;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// `(wall_ms, counter, device_id)` triple used for last-writer-wins ordering.
///
/// Comparison is numeric on `wall_ms`, then numeric on `counter`, then
/// lexicographic on `device_id`. The counter is never compared
/// lexicographically, even though it round-trips through JSON as a number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Hlc {
    pub wall_ms: i64,
    pub counter: u64,
    pub device_id: String,
}

impl Hlc {
    pub fn new(wall_ms: i64, counter: u64, device_id: impl Into<String>) -> SyncResult<Self> {
        let device_id = device_id.into();
        if wall_ms < 0 {
            return Err(SyncError::InvalidHlc("wall_ms must be non-negative"));
        }
        if device_id.is_empty() {
            return Err(SyncError::InvalidHlc("device_id must not be empty"));
        }
        Ok(Self {
            wall_ms,
            counter,
            device_id,
        })
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.device_id.cmp(&other.device_id))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.wall_ms, self.counter, self.device_id)
    }
}

/// Durable storage for the last issued clock. An implementer backing this
/// with a real adapter must persist `set_last` synchronously with respect to
/// the HLC service's own serial queue (the in-memory reference here is
/// sufficient for tests and for embedding alongside an adapter that tracks
/// its own last-issued HLC separately).
pub trait HlcStore: Send + Sync {
    fn get_last(&self) -> Option<Hlc>;
    fn set_last(&self, hlc: Hlc);
}

/// Reference in-memory store, guarded by the same mutex the service uses for
/// its serial queue — a separate lock would be redundant.
#[derive(Default)]
pub struct InMemoryHlcStore {
    last: Mutex<Option<Hlc>>,
}

impl InMemoryHlcStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HlcStore for InMemoryHlcStore {
    fn get_last(&self) -> Option<Hlc> {
        self.last.lock().unwrap().clone()
    }

    fn set_last(&self, hlc: Hlc) {
        *self.last.lock().unwrap() = Some(hlc);
    }
}

/// Object-safe view over an HLC service, so the Storage Engine and Sync Loop
/// can hold `Arc<dyn HlcClock>` without committing to a particular
/// `HlcStore` implementation.
pub trait HlcClock: Send + Sync {
    fn next(&self, now_ms: Option<i64>) -> SyncResult<Hlc>;
    fn next_batch(&self, count: usize, now_ms: Option<i64>) -> SyncResult<Vec<Hlc>>;
    fn next_from_remote(&self, remote: &Hlc, now_ms: Option<i64>) -> SyncResult<Hlc>;
    fn peek(&self) -> Option<Hlc>;
}

impl<S: HlcStore> HlcClock for HlcService<S> {
    fn next(&self, now_ms: Option<i64>) -> SyncResult<Hlc> {
        HlcService::next(self, now_ms)
    }

    fn next_batch(&self, count: usize, now_ms: Option<i64>) -> SyncResult<Vec<Hlc>> {
        HlcService::next_batch(self, count, now_ms)
    }

    fn next_from_remote(&self, remote: &Hlc, now_ms: Option<i64>) -> SyncResult<Hlc> {
        HlcService::next_from_remote(self, remote, now_ms)
    }

    fn peek(&self) -> Option<Hlc> {
        HlcService::peek(self)
    }
}

fn wall_clock_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Issues monotonic HLC triples for one device, serialized through an
/// internal mutex so that every mutating call observes the latest persisted
/// clock before computing and persisting the next one (spec.md §4.1
/// "Concurrency").
pub struct HlcService<S: HlcStore = InMemoryHlcStore> {
    device_id: String,
    store: S,
    // Guards the read-compute-persist critical section; the store itself may
    // have its own locking, but the HLC algorithm must run as one atomic
    // step with respect to other callers on this service.
    queue: Mutex<()>,
}

impl HlcService<InMemoryHlcStore> {
    pub fn new(device_id: impl Into<String>) -> SyncResult<Self> {
        Self::with_store(device_id, InMemoryHlcStore::new())
    }
}

impl<S: HlcStore> HlcService<S> {
    pub fn with_store(device_id: impl Into<String>, store: S) -> SyncResult<Self> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(SyncError::InvalidHlc("device_id must not be empty"));
        }
        Ok(Self {
            device_id,
            store,
            queue: Mutex::new(()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the last issued/merged clock without allocating a new one.
    pub fn peek(&self) -> Option<Hlc> {
        let _guard = self.queue.lock().unwrap();
        self.store.get_last()
    }

    /// Issues the next HLC for a local event.
    pub fn next(&self, now_ms: Option<i64>) -> SyncResult<Hlc> {
        let now = resolve_now(now_ms)?;
        let _guard = self.queue.lock().unwrap();
        let next = self.compute_next(now);
        self.store.set_last(next.clone());
        Ok(next)
    }

    /// Issues `count` strictly increasing HLCs in one critical section;
    /// only the last is persisted.
    pub fn next_batch(&self, count: usize, now_ms: Option<i64>) -> SyncResult<Vec<Hlc>> {
        if count == 0 {
            return Err(SyncError::InvalidArgument("count must be >= 1"));
        }
        let now = resolve_now(now_ms)?;
        let _guard = self.queue.lock().unwrap();
        let mut last = self.store.get_last();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let candidate = Self::advance(last.as_ref(), now, &self.device_id);
            last = Some(candidate.clone());
            out.push(candidate);
        }
        if let Some(final_hlc) = last {
            self.store.set_last(final_hlc);
        }
        Ok(out)
    }

    /// Merges a remote clock observation, returning a new local HLC that is
    /// strictly greater than both the local clock and the remote one.
    pub fn next_from_remote(&self, remote: &Hlc, now_ms: Option<i64>) -> SyncResult<Hlc> {
        let now = resolve_now(now_ms)?;
        let _guard = self.queue.lock().unwrap();
        let last = self.store.get_last();
        let last_wall = last.as_ref().map(|h| h.wall_ms);
        let wall = now.max(last_wall.unwrap_or(i64::MIN)).max(remote.wall_ms);

        let last_matches = last_wall == Some(wall);
        let remote_matches = remote.wall_ms == wall;

        let counter = match (last_matches, remote_matches) {
            (true, true) => {
                last.as_ref().unwrap().counter.max(remote.counter) + 1
            }
            (true, false) => last.as_ref().unwrap().counter + 1,
            (false, true) => remote.counter + 1,
            (false, false) => 0,
        };

        let next = Hlc {
            wall_ms: wall,
            counter,
            device_id: self.device_id.clone(),
        };
        self.store.set_last(next.clone());
        Ok(next)
    }

    fn compute_next(&self, now: i64) -> Hlc {
        let last = self.store.get_last();
        Self::advance(last.as_ref(), now, &self.device_id)
    }

    fn advance(last: Option<&Hlc>, now: i64, device_id: &str) -> Hlc {
        match last {
            None => Hlc {
                wall_ms: now,
                counter: 0,
                device_id: device_id.to_string(),
            },
            Some(last) if now > last.wall_ms => Hlc {
                wall_ms: now,
                counter: 0,
                device_id: device_id.to_string(),
            },
            Some(last) => Hlc {
                wall_ms: last.wall_ms,
                counter: last.counter + 1,
                device_id: device_id.to_string(),
            },
        }
    }
}

fn resolve_now(now_ms: Option<i64>) -> SyncResult<i64> {
    let now = now_ms.unwrap_or_else(wall_clock_now_ms);
    if now < 0 {
        return Err(SyncError::InvalidHlc("now_ms must be non-negative"));
    }
    Ok(now)
}
