//! The Sync Loop (spec.md §4.6): drives non-overlapping push/pull cycles
//! whenever the connection is `connected`, applies server-pushed events, and
//! persists the pull cursor. Its serial queue is a dedicated worker thread
//! draining an `mpsc` channel — the ambient-stack decision documented
//! alongside the rest of this crate's concurrency model, since nothing here
//! requires committing to a particular async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::engine::StorageEngine;
use crate::error::{SyncError, SyncResult};
use crate::row::{Row, SyncCursor};
use crate::transport::{PullRequest, PushRequest, TransportAdapter, TransportEvent};

#[derive(Debug, Clone)]
pub struct SyncLoopConfig {
    pub interval_ms: u64,
    pub push_batch_size: usize,
    pub pull_limit: usize,
    pub cursor_key: String,
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            push_batch_size: 200,
            pull_limit: 500,
            cursor_key: "sync.cursor.v1".to_string(),
        }
    }
}

enum Job {
    Cycle,
    ApplyRemote(Vec<Row>),
}

type ErrorHandler = Arc<dyn Fn(SyncError) + Send + Sync>;

/// Drives the push/pull cycle described in spec.md §4.6. Construct with
/// `SyncLoop::new`, then call `start()`; `stop()` tears everything down.
pub struct SyncLoop {
    engine: Arc<StorageEngine>,
    transport: Arc<dyn TransportAdapter>,
    connection: Arc<ConnectionManager>,
    config: SyncLoopConfig,
    on_error: ErrorHandler,

    started: AtomicBool,
    /// Prevents a timer from enqueuing a second cycle while one is already
    /// queued or running (spec.md §4.6 "dedup flag").
    cycle_pending: AtomicBool,

    job_tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    conn_unsub: Mutex<Option<crate::connection::Unsubscribe>>,
    transport_unsub: Mutex<Option<crate::transport::EventSubscription>>,
    /// Lets timer threads re-enter through `enqueue_cycle`'s dedup check
    /// without holding a strong cycle to the loop itself.
    self_weak: Mutex<Option<Weak<SyncLoop>>>,
}

impl SyncLoop {
    pub fn new(
        engine: Arc<StorageEngine>,
        transport: Arc<dyn TransportAdapter>,
        connection: Arc<ConnectionManager>,
        config: SyncLoopConfig,
        on_error: impl Fn(SyncError) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            transport,
            connection,
            config,
            on_error: Arc::new(on_error),
            started: AtomicBool::new(false),
            cycle_pending: AtomicBool::new(false),
            job_tx: Mutex::new(None),
            worker: Mutex::new(None),
            conn_unsub: Mutex::new(None),
            transport_unsub: Mutex::new(None),
            self_weak: Mutex::new(None),
        })
    }

    /// Subscribes to the connection manager and transport event stream, and
    /// enqueues an immediate cycle if already connected.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.self_weak.lock().unwrap() = Some(Arc::downgrade(self));

        let (tx, rx) = mpsc::channel::<Job>();
        *self.job_tx.lock().unwrap() = Some(tx);

        let worker_self = Arc::clone(self);
        let handle = thread::spawn(move || {
            for job in rx {
                worker_self.cycle_pending.store(false, Ordering::SeqCst);
                match job {
                    Job::Cycle => worker_self.run_cycle(),
                    Job::ApplyRemote(rows) => worker_self.run_apply_remote(&rows),
                }
            }
        });
        *self.worker.lock().unwrap() = Some(handle);

        let transition_self = Arc::clone(self);
        let unsub = self.connection.subscribe(move |_from, to| {
            // Leaving `connected` needs no explicit timer cancellation:
            // `run_cycle` re-checks connection state before doing any work,
            // so a timer that fires after the transition is a harmless
            // no-op. Entering `connected` always enqueues immediately.
            if to == ConnectionState::Connected {
                transition_self.enqueue_cycle(true);
            }
        });
        *self.conn_unsub.lock().unwrap() = Some(unsub);

        let event_self = Arc::clone(self);
        let transport_unsub = self.transport.on_event(Arc::new(move |event| match event {
            TransportEvent::ServerChanges { changes } => {
                event_self.enqueue_apply_remote(changes);
            }
            TransportEvent::NeedsAuth => {
                (event_self.on_error)(SyncError::AuthRequired);
            }
        }));
        *self.transport_unsub.lock().unwrap() = Some(transport_unsub);

        if self.connection.current() == ConnectionState::Connected {
            self.enqueue_cycle(true);
        }
    }

    /// Cancels the timer, unsubscribes, refuses further enqueues, and waits
    /// for any in-flight work on the serial queue to finish.
    pub fn stop(self: &Arc<Self>) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(unsub) = self.conn_unsub.lock().unwrap().take() {
            unsub.unsubscribe();
        }
        if let Some(unsub) = self.transport_unsub.lock().unwrap().take() {
            unsub.unsubscribe();
        }
        self.self_weak.lock().unwrap().take();
        // Dropping the sender lets the worker's `for job in rx` loop end
        // once the queue drains, then we join to flush in-flight work.
        self.job_tx.lock().unwrap().take();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn enqueue_cycle(&self, force: bool) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if !force && self.cycle_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cycle_pending.store(true, Ordering::SeqCst);
        if let Some(tx) = self.job_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Job::Cycle);
        }
    }

    fn enqueue_apply_remote(&self, rows: Vec<Row>) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.job_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Job::ApplyRemote(rows));
        }
    }

    fn run_apply_remote(&self, rows: &[Row]) {
        if let Err(err) = self.engine.apply_remote(rows) {
            (self.on_error)(err);
        }
    }

    fn run_cycle(&self) {
        if !self.started.load(Ordering::SeqCst)
            || self.connection.current() != ConnectionState::Connected
        {
            return;
        }

        if let Err(err) = self.push_phase() {
            (self.on_error)(err);
        }

        if self.started.load(Ordering::SeqCst)
            && self.connection.current() == ConnectionState::Connected
        {
            if let Err(err) = self.pull_phase() {
                (self.on_error)(err);
            }
        }

        self.schedule_timer();
    }

    fn push_phase(&self) -> SyncResult<()> {
        let mut last_first: Option<u64> = None;
        loop {
            let pending = self.engine.get_pending(self.config.push_batch_size)?;
            let Some(first_op) = pending.first() else {
                break;
            };
            let first = first_op.sequence;
            if let Some(last_first) = last_first {
                if first <= last_first {
                    break;
                }
            }
            last_first = Some(first);

            let resp = self.transport.push(PushRequest {
                ops: pending,
                ..Default::default()
            })?;
            match resp.acked_through_sequence {
                Some(acked) if acked >= first => {
                    self.engine.remove_pending_through(acked)?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn pull_phase(&self) -> SyncResult<()> {
        let mut cursor = self.read_cursor();
        loop {
            let resp = self.transport.pull(PullRequest {
                cursor: cursor.clone(),
                limit: self.config.pull_limit,
                ..Default::default()
            })?;

            if !resp.rows.is_empty() {
                self.engine.apply_remote(&resp.rows)?;
            }

            let advanced = match &resp.next_cursor {
                Some(next) => Some(next) != cursor.as_ref(),
                None => false,
            };
            if advanced {
                if let Some(next) = &resp.next_cursor {
                    self.engine
                        .put_kv(&self.config.cursor_key, serde_json::to_value(next)?)?;
                    cursor = Some(next.clone());
                }
            }

            if !resp.has_more || !advanced {
                break;
            }
        }
        Ok(())
    }

    fn read_cursor(&self) -> Option<SyncCursor> {
        match self.engine.get_kv(&self.config.cursor_key) {
            Ok(Some(value)) => match serde_json::from_value::<SyncCursor>(value) {
                Ok(cursor) => Some(cursor),
                Err(_) => {
                    (self.on_error)(SyncError::ProtocolError {
                        path: self.config.cursor_key.clone(),
                        expected: "{committedTimestampMs: number, collectionId: string, id: string}"
                            .to_string(),
                    });
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                (self.on_error)(err);
                None
            }
        }
    }

    fn schedule_timer(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let Some(weak) = self.self_weak.lock().unwrap().clone() else {
            return;
        };
        let interval = Duration::from_millis(self.config.interval_ms);

        // Holds only a `Weak` back to the loop: if `stop()` has dropped the
        // last strong reference by the time this fires, it quietly no-ops.
        thread::spawn(move || {
            thread::sleep(interval);
            if let Some(sync_loop) = weak.upgrade() {
                sync_loop.enqueue_cycle(false);
            }
        });
    }
}
