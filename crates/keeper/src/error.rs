use keeper_store::StoreError;
use keeper_types::{Key, TypeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("key not found: {0}")]
    NotFound(Key),

    #[error("keeper is closed")]
    Closed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported text encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("could not decode value as {encoding}: {reason}")]
    Decode { encoding: String, reason: String },

    #[error("stream is closed")]
    StreamClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for KeeperError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::Closed => Self::Closed,
            StoreError::Type(e) => Self::Type(e),
            other => Self::Store(other),
        }
    }
}

impl KeeperError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type KeeperResult<T> = Result<T, KeeperError>;
