//! Wave backend server.
//!
//! Owns the object store, the event broker and the RPC router, answers the
//! method table on the default route (`wavesrv`) and serves peers over a
//! domain socket, a websocket endpoint and optionally stdio.

pub mod auth;
pub mod config;
pub mod controllers;
pub mod coord;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod state;
pub mod tasks;
pub mod transport;

pub use auth::{route_for_claims, AuthProvider, TokenAuth};
pub use config::ServerConfig;
pub use controllers::{
    BlockControllers, BlockInput, ConnControllers, InMemoryBlockControllers, InMemoryConnControllers,
    InputTally,
};
pub use error::{ServerError, ServerResult};
pub use server::{ServerHandle, WaveServer};
pub use state::ServerState;
pub use tasks::{ActivityCounters, TaskPool};
