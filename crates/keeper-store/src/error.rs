use keeper_types::{Key, TypeError};

use crate::refcount::RefCountError;
use crate::traits::TempHandle;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No value is stored under the key.
    #[error("key not found: {0}")]
    NotFound(Key),

    /// The storage has been closed.
    #[error("storage is closed")]
    Closed,

    /// The temp handle is unknown to this storage.
    #[error("no such temp target: {0}")]
    NoSuchTemp(TempHandle),

    /// The temp handle was already promoted or discarded.
    #[error("temp target {0} was already consumed")]
    TempConsumed(TempHandle),

    /// A layout path that must be a directory is occupied by something else.
    #[error("storage area '{area}' exists but is not a directory")]
    StructuralConflict { area: String },

    /// Invalid key, shard depth, or configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A background flush of the key to the inner storage failed.
    #[error("background flush of {key} failed: {reason}")]
    FlushFailed { key: Key, reason: String },

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    RefCount(#[from] RefCountError),

    /// I/O error from the underlying medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
