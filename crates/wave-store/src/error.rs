use wave_types::{ORef, TypeError};

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(ORef),

    /// Insert of an oref that is already stored.
    #[error("object already exists: {0}")]
    AlreadyExists(ORef),

    /// The caller's copy is stale: its version does not match the stored one.
    #[error("version conflict on {oref}: presented {presented}, stored {stored}")]
    Conflict {
        oref: ORef,
        presented: i64,
        stored: i64,
    },

    /// The backend rejected the commit because a value read by the
    /// transaction changed underneath it.
    #[error("transaction conflict on {0}")]
    CommitConflict(String),

    /// The transaction outlived its deadline.
    #[error("transaction deadline exceeded")]
    Timeout,

    /// The object is malformed for the requested operation.
    #[error("invalid object {oref}: {reason}")]
    InvalidObject { oref: ORef, reason: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O or consistency failure in the backing engine.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Conflicts and missing objects are ordinary outcomes the caller may
    /// retry after re-reading.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::CommitConflict(_) | Self::NotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::CommitConflict(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<TypeError> for StoreError {
    fn from(e: TypeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
