use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid key length: expected {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("keys must be lowercase hex")]
    NotLowercase,

    #[error("attribute name '{0}' is reserved")]
    ReservedAttribute(String),

    #[error("attribute '{0}' given more than once")]
    DuplicateAttribute(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
