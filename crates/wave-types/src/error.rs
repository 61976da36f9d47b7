use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid object reference: {0:?}")]
    InvalidORef(String),

    #[error("unknown object type: {0:?}")]
    UnknownOType(String),

    #[error("object type mismatch: expected {expected}, got {actual}")]
    OTypeMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}
