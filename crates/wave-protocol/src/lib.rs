//! Wire protocol for the Wave backend.
//!
//! Defines the call frame exchanged between RPC peers, the length-prefixed
//! framing used on byte-stream transports, the error codes carried in error
//! responses, the method surface with its typed payloads, and the signed
//! tokens peers present to authenticate.

pub mod auth;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod methods;

pub use auth::{AuthKey, AuthToken, TokenClaims};
pub use codec::{read_frame, write_frame, WaveCodec, FRAME_VERSION};
pub use endpoint::{endpoints, HealthResponse};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    new_call_id, ErrorCode, FrameKind, RpcErrorBody, RpcMessage, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
