//! Connection Manager: tracks one node's network/auth reachability and
//! forwards de-duplicated state transitions to the Sync Loop and any other
//! listener (spec.md §4.4).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

/// A node's connection state machine. Transitions are driven by a
/// `ConnectionDriver` implementation (a platform network/auth watcher); the
/// manager itself never inspects the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Offline,
    Connected,
    NeedsAuth,
    Paused,
}

/// Platform-provided driver that reports raw connectivity/auth changes. A
/// real implementation watches the OS network reachability API and the
/// host's auth/session state; it has no opinion on sync scheduling.
pub trait ConnectionDriver: Send + Sync {
    /// Starts watching for changes, delivering them through `on_change`.
    /// Implementations call `on_change` from any thread.
    fn start(&self, on_change: Arc<dyn Fn(ConnectionState) + Send + Sync>);
    fn stop(&self);
}

type Listener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

struct Subscribers {
    next_id: u64,
    listeners: std::collections::HashMap<u64, Listener>,
}

impl Default for Subscribers {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: std::collections::HashMap::new(),
        }
    }
}

/// Coalesces raw driver callbacks into de-duplicated `(from, to)`
/// transitions and fans them out to subscribers (typically the Sync Loop).
/// Repeated reports of the same state are silently dropped (spec.md §4.4
/// "no-op transitions").
pub struct ConnectionManager {
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Subscribers>,
    driver: Arc<dyn ConnectionDriver>,
}

pub struct Unsubscribe {
    manager: std::sync::Weak<ConnectionManager>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.subscribers.lock().unwrap().listeners.remove(&self.id);
        }
    }
}

impl ConnectionManager {
    /// Starts in `Offline` until the driver reports otherwise (spec.md §4.4
    /// "Initial state").
    pub fn new(driver: Arc<dyn ConnectionDriver>) -> Arc<Self> {
        let manager = Arc::new(Self {
            state: Mutex::new(ConnectionState::Offline),
            subscribers: Mutex::new(Subscribers::default()),
            driver,
        });

        let weak = Arc::downgrade(&manager);
        manager.driver.start(Arc::new(move |new_state| {
            if let Some(manager) = weak.upgrade() {
                manager.report(new_state);
            }
        }));

        manager
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let mut subs = self.subscribers.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.listeners.insert(id, Arc::new(listener));
        Unsubscribe {
            manager: Arc::downgrade(self),
            id,
        }
    }

    pub fn shutdown(&self) {
        self.driver.stop();
    }

    fn report(&self, new_state: ConnectionState) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = *state;
            if previous == new_state {
                return;
            }
            *state = new_state;
            previous
        };

        let listeners: Vec<Listener> = {
            let subs = self.subscribers.lock().unwrap();
            subs.listeners.values().cloned().collect()
        };
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(previous, new_state))).is_err()
            {
                tracing::warn!("connection manager listener panicked; other listeners still ran");
            }
        }
    }
}

/// Reference driver for tests: transitions are injected manually rather than
/// observed from a real platform network stack.
#[derive(Default)]
pub struct ManualConnectionDriver {
    on_change: Mutex<Option<Arc<dyn Fn(ConnectionState) + Send + Sync>>>,
}

impl ManualConnectionDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, state: ConnectionState) {
        if let Some(cb) = self.on_change.lock().unwrap().as_ref() {
            cb(state);
        }
    }
}

impl ConnectionDriver for ManualConnectionDriver {
    fn start(&self, on_change: Arc<dyn Fn(ConnectionState) + Send + Sync>) {
        *self.on_change.lock().unwrap() = Some(on_change);
    }

    fn stop(&self) {
        *self.on_change.lock().unwrap() = None;
    }
}
