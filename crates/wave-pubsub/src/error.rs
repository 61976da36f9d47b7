/// Errors produced by the event broker.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("event name must not be empty")]
    EmptyEventName,

    #[error("route id must not be empty")]
    EmptyRouteId,

    #[error("invalid scope pattern: {0:?}")]
    InvalidScope(String),
}

/// Convenience alias used throughout the broker crate.
pub type BrokerResult<T> = Result<T, BrokerError>;
