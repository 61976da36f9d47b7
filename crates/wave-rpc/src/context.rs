use std::time::Duration;

use tokio::time::Instant;

use crate::endpoint::RpcEndpoint;

/// Per-call information handed to every inbound handler.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Endpoint the call arrived on. Replies and pushes to the caller go
    /// through it.
    pub endpoint: RpcEndpoint,
    pub call_id: String,
    pub command: String,
    /// Originating route of a forwarded call.
    pub source: Option<String>,
    /// Point after which the handler is aborted.
    pub deadline: Option<Instant>,
}

impl CallContext {
    /// Route identity of the caller: the forwarding source when present,
    /// otherwise the route the endpoint is registered under.
    pub fn route_id(&self) -> Option<String> {
        self.source.clone().or_else(|| self.endpoint.route_id())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The deadline in the form store transactions take.
    pub fn store_deadline(&self) -> Option<std::time::Instant> {
        self.deadline.map(Instant::into_std)
    }
}
