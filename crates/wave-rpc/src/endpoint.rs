use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use wave_protocol::{new_call_id, FrameKind, RpcMessage, TokenClaims};

use crate::context::CallContext;
use crate::error::{RpcError, RpcResult};
use crate::router::RpcRouter;
use crate::table::{Handler, MethodTable, StreamSender};
use crate::transport::{FrameSink, FrameSource};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-endpoint settings.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Label used in logs, e.g. `unix:3`.
    pub name: String,
    /// Outbound frames queued before senders wait.
    pub outgoing_capacity: usize,
    /// Items a stream handler may produce ahead of the outgoing queue.
    pub stream_buffer: usize,
    /// Items received on an outgoing stream that the consumer has not
    /// taken yet. Past this the stream is cancelled.
    pub stream_backlog: usize,
    /// Timeout for outgoing calls that do not set one.
    pub default_timeout: Duration,
    /// Deadline for inbound calls whose caller declared none.
    pub handler_timeout: Duration,
    /// Trusted peers may call every method without authenticating.
    pub trusted: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".into(),
            outgoing_capacity: 256,
            stream_buffer: 4,
            stream_backlog: 1024,
            default_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(2),
            trusted: false,
        }
    }
}

impl EndpointConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

/// Options for one outgoing call.
#[derive(Clone, Debug, Default)]
pub struct RpcOpts {
    pub timeout: Option<Duration>,
    /// Fire and forget: return as soon as the frame is queued.
    pub no_response: bool,
    /// Ask the peer to forward the call to this route.
    pub route: Option<String>,
    /// Originating route stamped on forwarded calls.
    pub source: Option<String>,
}

impl RpcOpts {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn no_response() -> Self {
        Self {
            no_response: true,
            ..Self::default()
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

enum StreamMsg {
    Item(Value),
    End,
    Failed(RpcError),
}

/// Receiving end of an outgoing stream as the reader task sees it.
///
/// The queue is unbounded so the reader never waits on a slow consumer;
/// `queued` caps it instead.
#[derive(Clone)]
struct StreamSlot {
    tx: mpsc::UnboundedSender<StreamMsg>,
    queued: Arc<AtomicUsize>,
}

enum Pending {
    Unary(oneshot::Sender<RpcResult<Value>>),
    Stream(StreamSlot),
}

#[derive(Default)]
struct Identity {
    route_id: Option<String>,
    claims: Option<TokenClaims>,
    authenticated: bool,
}

struct OrderedJob {
    command: String,
    fut: BoxFuture<'static, RpcResult<Value>>,
    deadline: Instant,
}

type CloseHook = Box<dyn FnOnce() + Send>;

struct Inner {
    id: u64,
    config: EndpointConfig,
    table: Arc<MethodTable>,
    outgoing: mpsc::Sender<RpcMessage>,
    ordered: mpsc::Sender<OrderedJob>,
    pending: Mutex<HashMap<String, Pending>>,
    inbound: Mutex<HashMap<String, AbortHandle>>,
    identity: RwLock<Identity>,
    closed: watch::Sender<bool>,
    close_hooks: Mutex<Vec<CloseHook>>,
    router: RwLock<Weak<RpcRouter>>,
}

/// One RPC peer over one transport.
///
/// Matches responses to outgoing calls by call id and dispatches inbound
/// calls to a [`MethodTable`]. Frames from the transport are handled in
/// arrival order; unary handlers then run concurrently, each under its own
/// deadline, while fire-and-forget calls run one at a time in arrival order.
///
/// Cloning is cheap and every clone drives the same peer. The endpoint
/// stays alive until [`close`](Self::close) is called or the transport
/// ends.
#[derive(Clone)]
pub struct RpcEndpoint {
    inner: Arc<Inner>,
}

impl RpcEndpoint {
    /// Start the reader, writer and ordered-call tasks for one transport.
    pub fn spawn<S, K>(source: S, sink: K, table: Arc<MethodTable>, config: EndpointConfig) -> Self
    where
        S: FrameSource,
        K: FrameSink,
    {
        let (out_tx, out_rx) = mpsc::channel(config.outgoing_capacity.max(1));
        let (ordered_tx, ordered_rx) = mpsc::channel(config.outgoing_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let endpoint = Self {
            inner: Arc::new(Inner {
                id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                table,
                outgoing: out_tx,
                ordered: ordered_tx,
                pending: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
                identity: RwLock::new(Identity::default()),
                closed,
                close_hooks: Mutex::new(Vec::new()),
                router: RwLock::new(Weak::new()),
            }),
        };
        tokio::spawn(read_loop(endpoint.clone(), source));
        tokio::spawn(write_loop(endpoint.clone(), sink, out_rx));
        tokio::spawn(ordered_loop(endpoint.inner.closed.subscribe(), ordered_rx));
        debug!(endpoint = %endpoint.name(), "endpoint started");
        endpoint
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn ptr_eq(&self, other: &RpcEndpoint) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Primary route this endpoint is known under.
    pub fn route_id(&self) -> Option<String> {
        self.read_identity().route_id.clone()
    }

    /// Set the primary route id if none is set yet.
    pub fn set_route_id(&self, route_id: &str) {
        let mut identity = self.write_identity();
        if identity.route_id.is_none() {
            identity.route_id = Some(route_id.to_string());
        }
    }

    pub fn mark_authenticated(&self, route_id: &str, claims: TokenClaims) {
        let mut identity = self.write_identity();
        identity.route_id = Some(route_id.to_string());
        identity.claims = Some(claims);
        identity.authenticated = true;
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.config.trusted || self.read_identity().authenticated
    }

    pub fn is_trusted(&self) -> bool {
        self.inner.config.trusted
    }

    pub fn claims(&self) -> Option<TokenClaims> {
        self.read_identity().claims.clone()
    }

    fn read_identity(&self) -> std::sync::RwLockReadGuard<'_, Identity> {
        self.inner.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_identity(&self) -> std::sync::RwLockWriteGuard<'_, Identity> {
        self.inner.identity.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let forwarded calls (`route` set on a frame) reach other peers.
    pub fn attach_router(&self, router: &Arc<RpcRouter>) {
        *self.inner.router.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(router);
    }

    pub fn router(&self) -> Option<Arc<RpcRouter>> {
        self.inner
            .router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the endpoint has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    /// Run `hook` once when the endpoint closes, or now if it already has.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = lock(&self.inner.close_hooks);
            if !self.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub fn close(&self) {
        self.shutdown(RpcError::Transport("endpoint closed".into()));
    }

    /// Mark closed, fail every pending call with `err`, abort inbound
    /// handlers and run the close hooks. Only the first call has effect.
    fn shutdown(&self, err: RpcError) {
        let hooks = {
            let mut hooks = lock(&self.inner.close_hooks);
            if self.inner.closed.send_replace(true) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        let pending: Vec<Pending> = lock(&self.inner.pending).drain().map(|(_, p)| p).collect();
        let failed = pending.len();
        for p in pending {
            match p {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                Pending::Stream(slot) => {
                    let _ = slot.tx.send(StreamMsg::Failed(err.clone()));
                }
            }
        }
        for (_, handle) in lock(&self.inner.inbound).drain() {
            handle.abort();
        }
        info!(endpoint = %self.name(), route = ?self.route_id(), failed, reason = %err, "endpoint closed");
        for hook in hooks {
            hook();
        }
    }

    /// Outgoing calls still waiting for a response or stream end.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Inbound calls whose handler is still running.
    pub fn inbound_calls(&self) -> usize {
        lock(&self.inner.inbound).len()
    }

    // ------------------------------------------------------------------
    // Outgoing calls
    // ------------------------------------------------------------------

    async fn enqueue(&self, frame: RpcMessage) -> RpcResult<()> {
        self.inner
            .outgoing
            .send(frame)
            .await
            .map_err(|_| RpcError::Transport(format!("endpoint {} is closed", self.name())))
    }

    fn ensure_open(&self) -> RpcResult<()> {
        if self.is_closed() {
            return Err(RpcError::Transport(format!("endpoint {} is closed", self.name())));
        }
        Ok(())
    }

    fn add_pending(&self, call_id: &str, pending: Pending) -> RpcResult<()> {
        lock(&self.inner.pending).insert(call_id.to_string(), pending);
        // shutdown may have drained the table between the check and the insert
        if self.is_closed() {
            lock(&self.inner.pending).remove(call_id);
            return self.ensure_open();
        }
        Ok(())
    }

    fn request_frame(call_id: &str, command: &str, data: Value, opts: &RpcOpts) -> RpcMessage {
        let mut frame = RpcMessage::request(call_id, command, data);
        frame.route = opts.route.clone();
        frame.source = opts.source.clone();
        frame
    }

    /// Send a call and wait for its response.
    ///
    /// With `no_response` set the call returns `Null` as soon as the frame
    /// is queued. Otherwise it fails with `Timeout` once `opts.timeout` (or
    /// the endpoint default) elapses; the timeout is also sent to the peer
    /// so that its handler gives up at the same time.
    pub async fn send_command(&self, command: &str, data: Value, opts: RpcOpts) -> RpcResult<Value> {
        self.ensure_open()?;
        let call_id = new_call_id();
        let frame = Self::request_frame(&call_id, command, data, &opts);
        if opts.no_response {
            return self.enqueue(frame.no_response()).await.map(|_| Value::Null);
        }

        let timeout = opts.timeout.unwrap_or(self.inner.config.default_timeout);
        let (tx, rx) = oneshot::channel();
        self.add_pending(&call_id, Pending::Unary(tx))?;
        let _guard = PendingGuard {
            inner: &self.inner,
            call_id: &call_id,
        };
        debug!(endpoint = %self.name(), method = command, callid = %call_id, "call");

        let exchange = async {
            self.enqueue(frame.with_timeout(timeout)).await?;
            rx.await
                .map_err(|_| RpcError::Transport("endpoint closed before the response".into()))?
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(format!("{command} timed out after {timeout:?}"))),
        }
    }

    /// Typed form of [`send_command`](Self::send_command).
    pub async fn call<Req, Resp>(&self, command: &str, req: &Req, opts: RpcOpts) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_value(req).map_err(|e| RpcError::BadRequest(e.to_string()))?;
        let value = self.send_command(command, data, opts).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Internal(format!("unexpected {command} response: {e}")))
    }

    /// Start a streaming call.
    ///
    /// Items arrive in order through the returned [`ResponseStream`]. A
    /// stream has no deadline unless `opts.timeout` is set. Dropping the
    /// stream early releases the call and asks the peer to stop producing.
    pub async fn send_stream(
        &self,
        command: &str,
        data: Value,
        opts: RpcOpts,
    ) -> RpcResult<ResponseStream> {
        self.ensure_open()?;
        let call_id = new_call_id();
        let mut frame = Self::request_frame(&call_id, command, data, &opts).streaming();
        if let Some(timeout) = opts.timeout {
            frame = frame.with_timeout(timeout);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        self.add_pending(
            &call_id,
            Pending::Stream(StreamSlot {
                tx,
                queued: queued.clone(),
            }),
        )?;
        let stream = ResponseStream {
            endpoint: self.clone(),
            call_id,
            rx,
            queued,
            finished: false,
        };
        debug!(endpoint = %self.name(), method = command, callid = %stream.call_id, "stream call");
        self.enqueue(frame).await?;
        Ok(stream)
    }

    /// Queue a fire-and-forget call without waiting for queue space.
    ///
    /// Returns false if the frame was dropped because the queue is full or
    /// the endpoint is closed.
    pub fn try_notify(&self, command: &str, data: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = RpcMessage::request(new_call_id(), command, data).no_response();
        self.inner.outgoing.try_send(frame).is_ok()
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_frame(&self, msg: RpcMessage) {
        match msg.kind() {
            FrameKind::Cancel => {
                if let Some(handle) = lock(&self.inner.inbound).remove(&msg.call_id) {
                    debug!(endpoint = %self.name(), callid = %msg.call_id, "inbound call cancelled");
                    handle.abort();
                }
            }
            FrameKind::Request => self.dispatch(msg).await,
            _ => self.resolve(msg),
        }
    }

    /// Hand a response frame to the outgoing call waiting on it.
    ///
    /// Runs on the reader task, so it must not wait on any one call.
    fn resolve(&self, msg: RpcMessage) {
        let kind = msg.kind();
        let waiter = {
            let mut pending = lock(&self.inner.pending);
            match (kind, pending.get(&msg.call_id)) {
                (FrameKind::StreamPart, Some(Pending::Stream(slot))) => {
                    Some(Waiter::StreamPart(slot.clone()))
                }
                (_, Some(_)) => pending.remove(&msg.call_id).map(Waiter::Final),
                (_, None) => None,
            }
        };
        let Some(waiter) = waiter else {
            debug!(endpoint = %self.name(), callid = %msg.call_id, "response for unknown call dropped");
            return;
        };

        let outcome = match kind {
            FrameKind::Error => Err(msg
                .error_body()
                .map(RpcError::from_body)
                .unwrap_or_else(|| RpcError::Internal("malformed error response".into()))),
            _ => Ok(msg.data),
        };
        match waiter {
            Waiter::StreamPart(slot) => {
                let backlog = self.inner.config.stream_backlog.max(1);
                if slot.queued.fetch_add(1, Ordering::SeqCst) >= backlog {
                    self.overflow(&msg.call_id, &slot, backlog);
                    return;
                }
                let item = outcome.unwrap_or(Value::Null);
                if slot.tx.send(StreamMsg::Item(item)).is_err() {
                    lock(&self.inner.pending).remove(&msg.call_id);
                }
            }
            Waiter::Final(Pending::Unary(tx)) => {
                let result = match kind {
                    FrameKind::StreamEnd => outcome.map(|_| Value::Null),
                    _ => outcome,
                };
                let _ = tx.send(result);
            }
            Waiter::Final(Pending::Stream(slot)) => {
                let tail = match (kind, outcome) {
                    (FrameKind::StreamEnd, _) => vec![StreamMsg::End],
                    (_, Err(e)) => vec![StreamMsg::Failed(e)],
                    (_, Ok(value)) => {
                        slot.queued.fetch_add(1, Ordering::SeqCst);
                        vec![StreamMsg::Item(value), StreamMsg::End]
                    }
                };
                for m in tail {
                    if slot.tx.send(m).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// The consumer of an outgoing stream fell too far behind: fail it
    /// after the items already queued and tell the peer to stop.
    fn overflow(&self, call_id: &str, slot: &StreamSlot, backlog: usize) {
        if lock(&self.inner.pending).remove(call_id).is_none() {
            return;
        }
        warn!(endpoint = %self.name(), callid = %call_id, backlog, "stream consumer fell behind, cancelling");
        let _ = slot.tx.send(StreamMsg::Failed(RpcError::Transport(format!(
            "stream {call_id} exceeded {backlog} unread items"
        ))));
        let _ = self.inner.outgoing.try_send(RpcMessage::cancel(call_id));
    }

    /// Route a new inbound call: forward it, queue it, or run it.
    async fn dispatch(&self, msg: RpcMessage) {
        let command = msg.command.clone().unwrap_or_default();
        debug!(endpoint = %self.name(), method = %command, callid = %msg.call_id, "inbound call");

        if let Some(route) = msg.route.clone() {
            if !self.is_authenticated() {
                self.reject(&msg, RpcError::Unauthenticated(format!("{command}: route is not authenticated")))
                    .await;
                return;
            }
            self.forward(msg, route, command).await;
            return;
        }

        let Some(entry) = self.inner.table.get(&command).cloned() else {
            self.reject(&msg, RpcError::UnknownMethod(command)).await;
            return;
        };
        if !entry.allow_unauthenticated && !self.is_authenticated() {
            self.reject(&msg, RpcError::Unauthenticated(format!("{command} requires authentication")))
                .await;
            return;
        }

        let timeout = msg.timeout_ms.map(Duration::from_millis);
        let mut ctx = CallContext {
            endpoint: self.clone(),
            call_id: msg.call_id.clone(),
            command: command.clone(),
            source: msg.source.clone(),
            deadline: None,
        };
        match entry.handler {
            Handler::Unary(f) => {
                let deadline = Instant::now() + timeout.unwrap_or(self.inner.config.handler_timeout);
                ctx.deadline = Some(deadline);
                let fut = f(ctx, msg.data);
                if msg.no_response {
                    self.run_ordered(command, fut, deadline).await;
                } else {
                    self.spawn_unary(msg.call_id, command, deadline, fut);
                }
            }
            Handler::Stream(f) => {
                if msg.no_response {
                    warn!(
                        endpoint = %self.name(),
                        method = %command,
                        "streaming method called as fire-and-forget, ignored"
                    );
                    return;
                }
                let deadline = timeout.map(|t| Instant::now() + t);
                ctx.deadline = deadline;
                self.spawn_stream(msg.call_id, command, deadline, move |tx| f(ctx, msg.data, tx));
            }
        }
    }

    async fn reject(&self, msg: &RpcMessage, err: RpcError) {
        debug!(endpoint = %self.name(), callid = %msg.call_id, error = %err, "call rejected");
        if msg.no_response {
            return;
        }
        let _ = self.enqueue(RpcMessage::error(&msg.call_id, &err.to_body())).await;
    }

    async fn forward(&self, msg: RpcMessage, route: String, command: String) {
        let Some(router) = self.router() else {
            self.reject(&msg, RpcError::RouteNotFound(route)).await;
            return;
        };
        let timeout = msg.timeout_ms.map(Duration::from_millis);
        let opts = RpcOpts {
            timeout,
            no_response: msg.no_response,
            route: None,
            source: msg.source.clone().or_else(|| self.route_id()),
        };
        debug!(endpoint = %self.name(), method = %command, route = %route, "forwarding call");

        if msg.stream {
            let deadline = timeout.map(|t| Instant::now() + t);
            let data = msg.data;
            let method = command.clone();
            self.spawn_stream(msg.call_id, command, deadline, move |tx| {
                async move {
                    let mut upstream = router.route_stream(&route, &method, data, opts).await?;
                    while let Some(item) = upstream.next().await {
                        tx.send_value(item?).await?;
                    }
                    Ok(())
                }
                .boxed()
            });
            return;
        }

        let deadline = Instant::now() + timeout.unwrap_or(self.inner.config.default_timeout);
        let method = command.clone();
        let data = msg.data;
        let fut = async move { router.route_command(&route, &method, data, opts).await }.boxed();
        if msg.no_response {
            self.run_ordered(command, fut, deadline).await;
        } else {
            self.spawn_unary(msg.call_id, command, deadline, fut);
        }
    }

    async fn run_ordered(
        &self,
        command: String,
        fut: BoxFuture<'static, RpcResult<Value>>,
        deadline: Instant,
    ) {
        let job = OrderedJob { command, fut, deadline };
        if self.inner.ordered.send(job).await.is_err() {
            debug!(endpoint = %self.name(), "ordered worker gone, call dropped");
        }
    }

    /// Register an inbound task so that a cancel frame or close can abort it.
    fn track_inbound<F>(&self, call_id: String, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut inbound = lock(&self.inner.inbound);
        let handle = tokio::spawn(task);
        inbound.insert(call_id, handle.abort_handle());
    }

    fn finish_inbound(&self, call_id: &str) {
        lock(&self.inner.inbound).remove(call_id);
    }

    fn spawn_unary(
        &self,
        call_id: String,
        command: String,
        deadline: Instant,
        fut: BoxFuture<'static, RpcResult<Value>>,
    ) {
        let ep = self.clone();
        let id = call_id.clone();
        self.track_inbound(call_id, async move {
            let mut handler = tokio::spawn(fut);
            let _guard = AbortOnDrop(handler.abort_handle());
            let result = match tokio::time::timeout_at(deadline, &mut handler).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) if join.is_panic() => {
                    error!(endpoint = %ep.name(), method = %command, callid = %id, "handler panicked");
                    Err(RpcError::Internal(format!("{command} handler panicked")))
                }
                Ok(Err(_)) => Err(RpcError::Internal(format!("{command} handler was cancelled"))),
                Err(_) => {
                    debug!(endpoint = %ep.name(), method = %command, callid = %id, "handler deadline exceeded");
                    Err(RpcError::Timeout(format!("{command} exceeded its deadline")))
                }
            };
            ep.finish_inbound(&id);
            let frame = match result {
                Ok(value) => RpcMessage::response(&id, value),
                Err(e) => RpcMessage::error(&id, &e.to_body()),
            };
            let _ = ep.enqueue(frame).await;
        });
    }

    /// Run a stream producer and relay its items as stream parts.
    ///
    /// The producer writes into a bounded channel, so it waits while the
    /// outgoing queue is full.
    fn spawn_stream<P>(&self, call_id: String, command: String, deadline: Option<Instant>, producer: P)
    where
        P: FnOnce(StreamSender) -> BoxFuture<'static, RpcResult<()>>,
    {
        let (tx, mut rx) = mpsc::channel(self.inner.config.stream_buffer.max(1));
        let fut = producer(StreamSender::new(tx));
        let ep = self.clone();
        let id = call_id.clone();
        self.track_inbound(call_id, async move {
            let mut handler = tokio::spawn(fut);
            let _guard = AbortOnDrop(handler.abort_handle());
            let relay = async {
                while let Some(item) = rx.recv().await {
                    ep.enqueue(RpcMessage::stream_part(&id, item)).await?;
                }
                match (&mut handler).await {
                    Ok(result) => result,
                    Err(join) if join.is_panic() => {
                        error!(endpoint = %ep.name(), method = %command, callid = %id, "stream handler panicked");
                        Err(RpcError::Internal(format!("{command} handler panicked")))
                    }
                    Err(_) => Err(RpcError::Internal(format!("{command} handler was cancelled"))),
                }
            };
            let result = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, relay)
                    .await
                    .unwrap_or_else(|_| Err(RpcError::Timeout(format!("{command} exceeded its deadline")))),
                None => relay.await,
            };
            ep.finish_inbound(&id);
            let last = match result {
                Ok(()) => RpcMessage::stream_end(&id),
                Err(e) => RpcMessage::error(&id, &e.to_body()),
            };
            let _ = ep.enqueue(last).await;
        });
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("route", &self.route_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Waiter {
    StreamPart(StreamSlot),
    Final(Pending),
}

struct PendingGuard<'a> {
    inner: &'a Inner,
    call_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(self.call_id);
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn read_loop<S: FrameSource>(ep: RpcEndpoint, mut source: S) {
    let mut closed = ep.inner.closed.subscribe();
    loop {
        let frame = tokio::select! {
            frame = source.recv() => frame,
            _ = wait_closed(&mut closed) => break,
        };
        match frame {
            Ok(Some(msg)) => {
                tokio::select! {
                    _ = ep.handle_frame(msg) => {}
                    _ = wait_closed(&mut closed) => break,
                }
            }
            Ok(None) => {
                ep.shutdown(RpcError::Transport("peer closed the connection".into()));
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!(endpoint = %ep.name(), error = %e, "dropping malformed frame");
            }
            Err(e) => {
                warn!(endpoint = %ep.name(), error = %e, "read failed");
                ep.shutdown(RpcError::Transport(e.to_string()));
                break;
            }
        }
    }
}

async fn write_loop<K: FrameSink>(ep: RpcEndpoint, mut sink: K, mut rx: mpsc::Receiver<RpcMessage>) {
    let mut closed = ep.inner.closed.subscribe();
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };
        if let Err(e) = sink.send(&frame).await {
            warn!(endpoint = %ep.name(), error = %e, "write failed");
            ep.shutdown(RpcError::Transport(format!("write failed: {e}")));
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(endpoint = %ep.name(), error = %e, "transport close failed");
    }
}

async fn ordered_loop(mut closed: watch::Receiver<bool>, mut rx: mpsc::Receiver<OrderedJob>) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };
        let mut handler = tokio::spawn(job.fut);
        let _guard = AbortOnDrop(handler.abort_handle());
        match tokio::time::timeout_at(job.deadline, &mut handler).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => debug!(method = %job.command, error = %e, "fire-and-forget call failed"),
            Ok(Err(join)) if join.is_panic() => error!(method = %job.command, "handler panicked"),
            Ok(Err(_)) => {}
            Err(_) => warn!(method = %job.command, "fire-and-forget call exceeded its deadline"),
        }
    }
}

/// Items of an outgoing streaming call.
///
/// Yields `Ok` items until the peer ends the stream, then `None`. An error
/// frame from the peer, or the endpoint closing mid-stream, yields one
/// `Err` and then `None`.
pub struct ResponseStream {
    endpoint: RpcEndpoint,
    call_id: String,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    queued: Arc<AtomicUsize>,
    finished: bool,
}

impl ResponseStream {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_all(mut self) -> RpcResult<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Stream for ResponseStream {
    type Item = RpcResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let msg = match self.rx.poll_recv(cx) {
            Poll::Ready(msg) => msg,
            Poll::Pending => return Poll::Pending,
        };
        match msg {
            Some(StreamMsg::Item(value)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Poll::Ready(Some(Ok(value)))
            }
            Some(StreamMsg::End) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Some(StreamMsg::Failed(e)) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.finished = true;
                Poll::Ready(Some(Err(RpcError::Transport(
                    "stream closed before completion".into(),
                ))))
            }
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        let removed = lock(&self.endpoint.inner.pending).remove(&self.call_id).is_some();
        if removed && !self.endpoint.is_closed() {
            debug!(endpoint = %self.endpoint.name(), callid = %self.call_id, "stream dropped early, cancelling");
            let _ = self
                .endpoint
                .inner
                .outgoing
                .try_send(RpcMessage::cancel(&self.call_id));
        }
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("call_id", &self.call_id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_pair, split_stream};
    use serde::Deserialize;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use wave_protocol::{read_frame, write_frame, FRAME_VERSION};

    #[derive(Deserialize)]
    struct CountRequest {
        n: u32,
        #[serde(default)]
        fail_after: Option<u32>,
    }

    fn server_table() -> MethodTable {
        MethodTable::new()
            .unary("echo", |_ctx, v: Value| async move { Ok(v) })
            .unary("whoami", |ctx: CallContext, _: ()| async move { Ok(ctx.route_id()) })
            .unary("fail", |_ctx, _: ()| async move {
                Err::<Value, _>(RpcError::NotFound("block:b9".into()))
            })
            .unary("panic", |_ctx, flag: bool| async move {
                if flag {
                    panic!("handler bug");
                }
                Ok(flag)
            })
            .unary("sleep", |_ctx, ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .stream("count", |_ctx, req: CountRequest, tx| async move {
                for i in 0..req.n {
                    if req.fail_after == Some(i) {
                        return Err(RpcError::NotFound(format!("item {i}")));
                    }
                    tx.send(&i).await?;
                }
                Ok(())
            })
            .unary("open", |_ctx, _: ()| async move { Ok("open") })
            .allow_unauthenticated("open")
    }

    fn connect(server: MethodTable, trusted: bool) -> (RpcEndpoint, RpcEndpoint) {
        connect_with(server, trusted, EndpointConfig::named("client").trusted())
    }

    fn connect_with(server: MethodTable, trusted: bool, client: EndpointConfig) -> (RpcEndpoint, RpcEndpoint) {
        let (a, b) = channel_pair(16);
        let mut config = EndpointConfig::named("server");
        config.trusted = trusted;
        let server = RpcEndpoint::spawn(a.0, a.1, Arc::new(server), config);
        let client = RpcEndpoint::spawn(b.0, b.1, Arc::new(MethodTable::new()), client);
        (server, client)
    }

    // ------------------------------------------------------------------
    // Unary calls
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn unary_round_trip() {
        let (_server, client) = connect(server_table(), true);
        let v = client
            .send_command("echo", json!({"a": 1}), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(v, json!({"a": 1}));
        let ms: u64 = client.call("sleep", &5u64, RpcOpts::default()).await.unwrap();
        assert_eq!(ms, 5);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn handler_errors_come_back_typed() {
        let (_server, client) = connect(server_table(), true);
        let err = client
            .send_command("fail", Value::Null, RpcOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NotFound("block:b9".into()));

        let err = client
            .send_command("nosuchmethod", Value::Null, RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownMethod(_)));

        let err = client
            .send_command("sleep", json!("soon"), RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::BadRequest(_)));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let (_server, client) = connect(server_table(), true);
        let err = client
            .send_command("panic", json!(true), RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Internal(_)));
        let v = client
            .send_command("echo", json!("still here"), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(v, json!("still here"));
    }

    #[tokio::test]
    async fn call_times_out_before_slow_handler_finishes() {
        let (server, client) = connect(server_table(), true);
        let start = Instant::now();
        let err = client
            .send_command("sleep", json!(500), RpcOpts::timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
        assert_eq!(client.pending_calls(), 0);

        // the handler ran under the same deadline and has been aborted
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.inbound_calls(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_runs_in_arrival_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let table = MethodTable::new().unary("push", move |_ctx, n: u32| {
            let sink = sink.clone();
            async move {
                // later calls finish faster, so concurrent execution would reorder
                tokio::time::sleep(Duration::from_millis(u64::from(5 - n) * 5)).await;
                sink.lock().unwrap().push(n);
                Ok(())
            }
        });
        let (_server, client) = connect(table, true);
        for n in 0..5u32 {
            let v = client
                .send_command("push", json!(n), RpcOpts::no_response())
                .await
                .unwrap();
            assert_eq!(v, Value::Null);
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while log.lock().unwrap().len() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn stream_runs_to_completion() {
        let (_server, client) = connect(server_table(), true);
        let stream = client
            .send_stream("count", json!({"n": 3}), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(stream.collect_all().await.unwrap(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stream_error_ends_the_stream() {
        let (_server, client) = connect(server_table(), true);
        let mut stream = client
            .send_stream("count", json!({"n": 3, "fail_after": 1}), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(0));
        assert!(matches!(stream.next().await, Some(Err(RpcError::NotFound(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_consumer_stops_early_releases_call() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let table = MethodTable::new().stream("ticks", move |_ctx, n: u32, tx| {
            let counter = counter.clone();
            async move {
                for i in 0..n {
                    tx.send(&i).await?;
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(())
            }
        });
        let (server, client) = connect(table, true);
        let mut stream = client
            .send_stream("ticks", json!(5), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(0));
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
        drop(stream);
        assert_eq!(client.pending_calls(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.inbound_calls(), 0);
        let seen = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(produced.load(Ordering::SeqCst), seen);
        assert!(seen < 5);
    }

    #[tokio::test]
    async fn unread_stream_does_not_stall_other_calls() {
        let (_server, client) = connect(server_table(), true);
        let stream = client
            .send_stream("count", json!({"n": 50}), RpcOpts::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let v = client
            .send_command("echo", json!(1), RpcOpts::timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(v, json!(1));

        let items = stream.collect_all().await.unwrap();
        assert_eq!(items.len(), 50);
        assert_eq!(items[49], json!(49));
    }

    #[tokio::test]
    async fn stream_past_its_backlog_is_cancelled() {
        let mut config = EndpointConfig::named("client").trusted();
        config.stream_backlog = 8;
        let (server, client) = connect_with(server_table(), true, config);
        let mut stream = client
            .send_stream("count", json!({"n": 50}), RpcOpts::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.pending_calls(), 0);

        for i in 0..8 {
            assert_eq!(stream.next().await.unwrap().unwrap(), json!(i));
        }
        assert!(matches!(stream.next().await, Some(Err(RpcError::Transport(_)))));
        assert!(stream.next().await.is_none());

        // the producer was told to stop
        tokio::time::timeout(Duration::from_secs(1), async {
            while server.inbound_calls() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let v = client
            .send_command("echo", json!("after"), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(v, json!("after"));
    }

    // ------------------------------------------------------------------
    // Authentication and lifecycle
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn unauthenticated_peer_is_restricted() {
        let (server, client) = connect(server_table(), false);
        let err = client
            .send_command("echo", json!(1), RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Unauthenticated(_)));
        let v = client
            .send_command("open", Value::Null, RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(v, json!("open"));

        server.mark_authenticated("conn:dev", TokenClaims::default());
        let who: Option<String> = client.call("whoami", &(), RpcOpts::default()).await.unwrap();
        assert_eq!(who.as_deref(), Some("conn:dev"));
    }

    #[tokio::test]
    async fn closing_fails_pending_calls() {
        let (server, client) = connect(server_table(), true);
        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command("sleep", json!(1000), RpcOpts::timeout(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        client.closed().await;
        assert!(client.is_closed());
        let err = client
            .send_command("echo", json!(1), RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn close_hooks_run_once() {
        let (server, _client) = connect(server_table(), true);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        server.on_close(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        server.close();
        server.close();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let r = runs.clone();
        server.on_close(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_not_fatal() {
        let (ours, theirs) = tokio::io::duplex(8192);
        let (src, sink) = split_stream(theirs);
        let _server = RpcEndpoint::spawn(
            src,
            sink,
            Arc::new(server_table()),
            EndpointConfig::named("sock").trusted(),
        );
        let (mut rd, mut wr) = tokio::io::split(ours);

        let junk = b"{not json";
        let mut raw = ((junk.len() + 1) as u32).to_be_bytes().to_vec();
        raw.push(FRAME_VERSION);
        raw.extend_from_slice(junk);
        wr.write_all(&raw).await.unwrap();
        write_frame(&mut wr, &RpcMessage::request("c1", "echo", json!("hi")))
            .await
            .unwrap();

        let reply = read_frame(&mut rd).await.unwrap().unwrap();
        assert_eq!(reply.call_id, "c1");
        assert_eq!(reply.kind(), FrameKind::Response);
        assert_eq!(reply.data, json!("hi"));
    }
}
