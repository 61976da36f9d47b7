use thiserror::Error;

use wave_protocol::{ErrorCode, ProtocolError, RpcErrorBody};
use wave_pubsub::BrokerError;
use wave_store::StoreError;

/// Errors surfaced by RPC calls, local or remote.
///
/// Every variant maps to one wire [`ErrorCode`], so an error raised by a
/// handler on one side comes back as the same variant on the other.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("route already registered: {0}")]
    RouteConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) | Self::RouteConflict(_) => ErrorCode::Conflict,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Transport(_) => ErrorCode::Transport,
            Self::RouteNotFound(_) => ErrorCode::RouteNotFound,
            Self::Storage(_) => ErrorCode::Storage,
            Self::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Detail text without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Timeout(m)
            | Self::Transport(m)
            | Self::RouteNotFound(m)
            | Self::RouteConflict(m)
            | Self::Storage(m)
            | Self::Unauthenticated(m)
            | Self::UnknownMethod(m)
            | Self::BadRequest(m)
            | Self::Internal(m) => m,
        }
    }

    pub fn to_body(&self) -> RpcErrorBody {
        RpcErrorBody::new(self.code(), self.message())
    }

    pub fn from_body(body: RpcErrorBody) -> Self {
        let m = body.message;
        match body.code {
            ErrorCode::NotFound => Self::NotFound(m),
            ErrorCode::Conflict => Self::Conflict(m),
            ErrorCode::Timeout => Self::Timeout(m),
            ErrorCode::Transport => Self::Transport(m),
            ErrorCode::RouteNotFound => Self::RouteNotFound(m),
            ErrorCode::Storage => Self::Storage(m),
            ErrorCode::Unauthenticated => Self::Unauthenticated(m),
            ErrorCode::UnknownMethod => Self::UnknownMethod(m),
            ErrorCode::BadRequest => Self::BadRequest(m),
            ErrorCode::Internal => Self::Internal(m),
        }
    }

    /// Worth retrying once the caller has re-read its state.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Timeout(_))
    }

    /// The peer is gone; its route should be torn down.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RouteNotFound(_))
    }
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        let message = e.to_string();
        match e {
            StoreError::NotFound(_) => Self::NotFound(message),
            StoreError::Conflict { .. } | StoreError::CommitConflict(_) | StoreError::AlreadyExists(_) => {
                Self::Conflict(message)
            }
            StoreError::Timeout => Self::Timeout(message),
            StoreError::InvalidObject { .. } => Self::BadRequest(message),
            StoreError::Serialization(_) | StoreError::Storage(_) => Self::Storage(message),
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        let message = e.to_string();
        match e {
            ProtocolError::Io(_) | ProtocolError::FramingError(_) | ProtocolError::UnsupportedVersion(_) => {
                Self::Transport(message)
            }
            ProtocolError::InvalidToken(_) => Self::Unauthenticated(message),
            ProtocolError::MessageTooLarge { .. }
            | ProtocolError::InvalidFrame(_)
            | ProtocolError::Deserialization(_) => Self::BadRequest(message),
            ProtocolError::Serialization(_) => Self::Internal(message),
        }
    }
}

impl From<BrokerError> for RpcError {
    fn from(e: BrokerError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
