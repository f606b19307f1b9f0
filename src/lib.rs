pub mod adapter;
pub mod connection;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod hlc;
pub mod row;
pub mod sync_loop;
pub mod transport;

pub use adapter::{InMemoryAdapter, RowStorageAdapter};
pub use connection::{ConnectionDriver, ConnectionManager, ConnectionState, ManualConnectionDriver};
pub use engine::{ApplyRemoteResult, StorageEngine, Unsubscribe};
pub use error::{SyncError, SyncResult};
pub use hlc::{Hlc, HlcClock, HlcService, HlcStore};
pub use row::{
    AtomicOp, ChangeEvent, ChangeSource, InvalidationHint, PendingOp, PendingOpKind, PutOptions,
    Row, RowIdentity, RowQuery, SyncCursor, WriteResult,
};
pub use sync_loop::{SyncLoop, SyncLoopConfig};
pub use transport::{
    EventSubscription, InMemoryTransport, PullRequest, PullResponse, PushAck, PushRequest,
    TransportAdapter, TransportEvent,
};
