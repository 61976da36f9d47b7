//! RPC layer of the Wave backend.
//!
//! An [`RpcEndpoint`] is one peer over one transport: it matches responses
//! to outgoing calls, dispatches inbound calls to a static [`MethodTable`],
//! and carries unary, fire-and-forget and streaming calls. The
//! [`RpcRouter`] maps route ids to endpoints so that calls and events reach
//! a peer by name, whichever transport it arrived on.
//!
//! # Design Rules
//!
//! - Handler errors become error frames; they never close an endpoint.
//! - Only a failed read or write closes an endpoint. Closing fails every
//!   pending call with `Transport` and removes the endpoint's routes.
//! - Every inbound call runs under a deadline. Streams only have one when
//!   the caller asked for it.

pub mod context;
pub mod endpoint;
pub mod error;
pub mod router;
pub mod table;
pub mod transport;

pub use context::CallContext;
pub use endpoint::{EndpointConfig, ResponseStream, RpcEndpoint, RpcOpts};
pub use error::{RpcError, RpcResult};
pub use router::{
    conn_route, controller_route, proc_route, route_scope, RpcRouter, DEFAULT_ROUTE,
};
pub use table::{MethodTable, StreamSender};
pub use transport::{
    channel_pair, split_stream, ChannelEnd, ChannelSink, ChannelSource, FrameSink, FrameSource,
    StreamSink, StreamSource,
};
