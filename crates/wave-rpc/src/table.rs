use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::CallContext;
use crate::error::{RpcError, RpcResult};

pub(crate) type UnaryFn = dyn Fn(CallContext, Value) -> BoxFuture<'static, RpcResult<Value>> + Send + Sync;
pub(crate) type StreamFn =
    dyn Fn(CallContext, Value, StreamSender) -> BoxFuture<'static, RpcResult<()>> + Send + Sync;

/// Producer half of an inbound streaming call.
///
/// `send` waits while the stream's buffer is full, so a slow consumer slows
/// the producer down instead of growing memory.
#[derive(Clone, Debug)]
pub struct StreamSender {
    tx: mpsc::Sender<Value>,
}

impl StreamSender {
    pub(crate) fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }

    pub async fn send<T: Serialize>(&self, item: &T) -> RpcResult<()> {
        let value = serde_json::to_value(item).map_err(|e| RpcError::Internal(e.to_string()))?;
        self.send_value(value).await
    }

    /// Fails once the consumer has gone away.
    pub async fn send_value(&self, value: Value) -> RpcResult<()> {
        self.tx
            .send(value)
            .await
            .map_err(|_| RpcError::Transport("stream consumer went away".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Clone)]
pub(crate) enum Handler {
    Unary(Arc<UnaryFn>),
    Stream(Arc<StreamFn>),
}

#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub(crate) handler: Handler,
    pub(crate) allow_unauthenticated: bool,
}

/// Static map from method name to typed handler.
///
/// Built once before an endpoint starts serving. Requests are decoded into
/// the handler's request type before it runs, and a request that does not
/// fit is answered with `badrequest` without reaching the handler.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodEntry>,
    problems: Vec<String>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request/response method.
    pub fn unary<Req, Resp, F, Fut>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Resp>> + Send + 'static,
    {
        let handler: Arc<UnaryFn> = Arc::new(move |ctx: CallContext, data: Value| {
            match decode_request::<Req>(data) {
                Ok(req) => {
                    let fut = f(ctx, req);
                    async move {
                        let resp = fut.await?;
                        serde_json::to_value(resp).map_err(|e| RpcError::Internal(e.to_string()))
                    }
                    .boxed()
                }
                Err(e) => future::ready(Err(e)).boxed(),
            }
        });
        self.insert(name, Handler::Unary(handler))
    }

    /// Register a streaming method. The handler pushes items through the
    /// [`StreamSender`]; returning ends the stream, returning an error ends
    /// it with an error frame.
    pub fn stream<Req, F, Fut>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(CallContext, Req, StreamSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<()>> + Send + 'static,
    {
        let handler: Arc<StreamFn> =
            Arc::new(move |ctx: CallContext, data: Value, sender: StreamSender| {
                match decode_request::<Req>(data) {
                    Ok(req) => f(ctx, req, sender).boxed(),
                    Err(e) => future::ready(Err(e)).boxed(),
                }
            });
        self.insert(name, Handler::Stream(handler))
    }

    /// Let routes that have not authenticated call `name`.
    pub fn allow_unauthenticated(mut self, name: &str) -> Self {
        match self.methods.get_mut(name) {
            Some(entry) => entry.allow_unauthenticated = true,
            None => self
                .problems
                .push(format!("{name}: marked unauthenticated but not registered")),
        }
        self
    }

    fn insert(mut self, name: &str, handler: Handler) -> Self {
        if !is_valid_method_name(name) {
            self.problems.push(format!("{name:?}: invalid method name"));
            return self;
        }
        let entry = MethodEntry {
            handler,
            allow_unauthenticated: false,
        };
        if self.methods.insert(name.to_string(), entry).is_some() {
            self.problems.push(format!("{name}: registered twice"));
        }
        self
    }

    /// Check the table before serving. Reports every registration problem
    /// at once.
    pub fn validate(&self) -> RpcResult<()> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(RpcError::Internal(format!(
                "invalid method table: {}",
                self.problems.join("; ")
            )))
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn is_streaming(&self, name: &str) -> bool {
        matches!(self.methods.get(name), Some(MethodEntry { handler: Handler::Stream(_), .. }))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

fn is_valid_method_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == ':')
}

/// Absent data decodes as `null` first, then as an empty object, so that
/// request types made only of defaults accept a bare call.
fn decode_request<Req: DeserializeOwned>(data: Value) -> RpcResult<Req> {
    let was_null = data.is_null();
    match serde_json::from_value(data) {
        Ok(req) => Ok(req),
        Err(e) if was_null => serde_json::from_value(Value::Object(Default::default()))
            .map_err(|_| RpcError::BadRequest(format!("missing request data: {e}"))),
        Err(e) => Err(RpcError::BadRequest(format!("invalid request data: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Paged {
        #[serde(default)]
        limit: u32,
    }

    fn table() -> MethodTable {
        MethodTable::new()
            .unary("echo", |_ctx, v: Value| async move { Ok(v) })
            .unary("paged", |_ctx, p: Paged| async move { Ok(p.limit) })
            .stream("count", |_ctx, n: u32, tx| async move {
                for i in 0..n {
                    tx.send(&i).await?;
                }
                Ok(())
            })
    }

    #[test]
    fn valid_table() {
        let t = table().allow_unauthenticated("echo");
        t.validate().unwrap();
        assert_eq!(t.names(), vec!["count", "echo", "paged"]);
        assert!(t.is_streaming("count"));
        assert!(!t.is_streaming("echo"));
        assert!(t.get("echo").unwrap().allow_unauthenticated);
        assert!(!t.get("paged").unwrap().allow_unauthenticated);
    }

    #[test]
    fn duplicates_and_bad_names_are_reported() {
        let t = table()
            .unary("echo", |_ctx, v: Value| async move { Ok(v) })
            .unary("Bad Name", |_ctx, v: Value| async move { Ok(v) })
            .allow_unauthenticated("missing");
        let err = t.validate().unwrap_err().to_string();
        assert!(err.contains("echo: registered twice"));
        assert!(err.contains("invalid method name"));
        assert!(err.contains("missing"));
    }

    #[test]
    fn decode_null_as_defaults() {
        let p: Paged = decode_request(Value::Null).unwrap();
        assert_eq!(p.limit, 0);
        let unit: () = decode_request(Value::Null).unwrap();
        assert_eq!(unit, ());
        assert!(matches!(
            decode_request::<Paged>(serde_json::json!({"limit": "x"})),
            Err(RpcError::BadRequest(_))
        ));
    }
}
