use thiserror::Error;

use wave_rpc::RpcError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("protocol error: {0}")]
    Protocol(#[from] wave_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] wave_store::StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] wave_pubsub::BrokerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl From<ServerError> for RpcError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::AuthFailed(msg) => RpcError::Unauthenticated(msg),
            ServerError::Rpc(e) => e,
            ServerError::Protocol(e) => e.into(),
            ServerError::Store(e) => e.into(),
            ServerError::Broker(e) => e.into(),
            ServerError::Config(msg) => RpcError::BadRequest(msg),
            ServerError::Io(e) => RpcError::Internal(e.to_string()),
            ServerError::Internal(msg) => RpcError::Internal(msg),
        }
    }
}
