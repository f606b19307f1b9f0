use thiserror::Error;

/// Every failure mode the engine can surface, per the error handling design:
/// caller mistakes, HLC malformations, adapter/transport backend failures,
/// and the sync-loop-visible `AuthRequired` signal.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid hlc: {0}")]
    InvalidHlc(&'static str),

    #[error("namespace mismatch: row namespace {row} does not match adapter namespace {adapter}")]
    NamespaceMismatch { row: String, adapter: String },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("adapter backend error: {0}")]
    AdapterBackendError(String),

    #[error("transport error: status={status} body={body}")]
    TransportError { status: u16, body: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("protocol error at {path}: expected {expected}")]
    ProtocolError { path: String, expected: String },

    #[error("authentication required")]
    AuthRequired,
}

pub type SyncResult<T> = Result<T, SyncError>;
