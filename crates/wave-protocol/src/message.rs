use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded payload size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Fresh call id for an outgoing frame.
pub fn new_call_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One RPC frame.
///
/// A frame with `command` set and `response` unset is a new invocation.
/// A frame with `response` set and no `command` answers the call named by
/// `callid`: a plain response, one part of a stream (`stream`), the end of a
/// stream (`done`), or an error (`iserror`, with an [`RpcErrorBody`] as data).
/// A `cancel` frame asks the peer to stop producing for `callid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(rename = "callid")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "is_false")]
    pub response: bool,
    #[serde(default, rename = "iserror", skip_serializing_if = "is_false")]
    pub is_error: bool,
    /// On a request: the caller expects a stream. On a response: one part.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
    #[serde(default, rename = "noresponse", skip_serializing_if = "is_false")]
    pub no_response: bool,
    #[serde(default, rename = "timeoutms", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Destination route when the frame should be forwarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Originating route of a forwarded frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Classification of a frame by its flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    StreamPart,
    StreamEnd,
    Error,
    Cancel,
}

impl RpcMessage {
    fn blank(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            command: None,
            data: Value::Null,
            response: false,
            is_error: false,
            stream: false,
            done: false,
            cancel: false,
            no_response: false,
            timeout_ms: None,
            route: None,
            source: None,
        }
    }

    pub fn request(call_id: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self {
            command: Some(command.into()),
            data,
            ..Self::blank(call_id)
        }
    }

    pub fn response(call_id: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            response: true,
            ..Self::blank(call_id)
        }
    }

    pub fn stream_part(call_id: impl Into<String>, data: Value) -> Self {
        Self {
            stream: true,
            ..Self::response(call_id, data)
        }
    }

    pub fn stream_end(call_id: impl Into<String>) -> Self {
        Self {
            done: true,
            ..Self::response(call_id, Value::Null)
        }
    }

    pub fn error(call_id: impl Into<String>, body: &RpcErrorBody) -> Self {
        Self {
            is_error: true,
            ..Self::response(call_id, serde_json::to_value(body).unwrap_or(Value::Null))
        }
    }

    pub fn cancel(call_id: impl Into<String>) -> Self {
        Self {
            cancel: true,
            ..Self::blank(call_id)
        }
    }

    pub fn no_response(mut self) -> Self {
        self.no_response = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> FrameKind {
        if self.cancel {
            FrameKind::Cancel
        } else if !self.response {
            FrameKind::Request
        } else if self.is_error {
            FrameKind::Error
        } else if self.done {
            FrameKind::StreamEnd
        } else if self.stream {
            FrameKind::StreamPart
        } else {
            FrameKind::Response
        }
    }

    /// Error body of an error frame.
    pub fn error_body(&self) -> Option<RpcErrorBody> {
        if !self.is_error {
            return None;
        }
        Some(
            serde_json::from_value(self.data.clone()).unwrap_or_else(|_| RpcErrorBody {
                code: ErrorCode::Internal,
                message: self.data.to_string(),
            }),
        )
    }

    /// Reject frames whose flags contradict each other.
    pub fn validate(&self) -> ProtocolResult<()> {
        let invalid = |reason: &str| Err(ProtocolError::InvalidFrame(reason.to_string()));
        if self.call_id.is_empty() {
            return invalid("missing callid");
        }
        if self.cancel {
            if self.command.is_some() || self.response {
                return invalid("cancel frame carries a command or response");
            }
            return Ok(());
        }
        if self.response {
            if self.command.is_some() {
                return invalid("response frame carries a command");
            }
            if self.is_error && self.stream {
                return invalid("error frame marked as stream part");
            }
            return Ok(());
        }
        match self.command.as_deref() {
            None | Some("") => invalid("request frame without command"),
            Some(_) if self.is_error || self.done => invalid("request frame with response flags"),
            Some(_) if self.no_response && self.stream => {
                invalid("streaming request cannot be fire-and-forget")
            }
            Some(_) => Ok(()),
        }
    }
}

/// Error kinds carried in error responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    Timeout,
    Transport,
    RouteNotFound,
    Storage,
    Unauthenticated,
    UnknownMethod,
    BadRequest,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "notfound",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::RouteNotFound => "routenotfound",
            Self::Storage => "storage",
            Self::Unauthenticated => "unauthenticated",
            Self::UnknownMethod => "unknownmethod",
            Self::BadRequest => "badrequest",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape_omits_defaults() {
        let msg = RpcMessage::request("c1", "getmeta", json!({"oref": "block:b1"}))
            .with_timeout(Duration::from_millis(200));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"callid": "c1", "command": "getmeta", "data": {"oref": "block:b1"}, "timeoutms": 200})
        );
    }

    #[test]
    fn kinds_follow_flags() {
        assert_eq!(RpcMessage::request("c", "x", Value::Null).kind(), FrameKind::Request);
        assert_eq!(RpcMessage::response("c", Value::Null).kind(), FrameKind::Response);
        assert_eq!(RpcMessage::stream_part("c", json!(1)).kind(), FrameKind::StreamPart);
        assert_eq!(RpcMessage::stream_end("c").kind(), FrameKind::StreamEnd);
        assert_eq!(RpcMessage::cancel("c").kind(), FrameKind::Cancel);
        let err = RpcMessage::error("c", &RpcErrorBody::new(ErrorCode::NotFound, "gone"));
        assert_eq!(err.kind(), FrameKind::Error);
        assert_eq!(err.error_body().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn validate_rejects_contradictions() {
        assert!(RpcMessage::request("", "x", Value::Null).validate().is_err());
        assert!(RpcMessage::request("c", "", Value::Null).validate().is_err());
        let mut bad = RpcMessage::response("c", Value::Null);
        bad.command = Some("x".into());
        assert!(bad.validate().is_err());
        assert!(RpcMessage::request("c", "x", Value::Null)
            .streaming()
            .no_response()
            .validate()
            .is_err());
        assert!(RpcMessage::request("c", "x", Value::Null).streaming().validate().is_ok());
        assert!(RpcMessage::cancel("c").validate().is_ok());
    }

    #[test]
    fn error_codes_serialize_lowercase() {
        let body = RpcErrorBody::new(ErrorCode::RouteNotFound, "no route");
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"code": "routenotfound", "message": "no route"})
        );
        assert_eq!(ErrorCode::UnknownMethod.to_string(), "unknownmethod");
    }

    #[test]
    fn unparseable_error_body_becomes_internal() {
        let mut msg = RpcMessage::response("c", json!("boom"));
        msg.is_error = true;
        let body = msg.error_body().unwrap();
        assert_eq!(body.code, ErrorCode::Internal);
    }
}
