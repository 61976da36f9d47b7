use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use wave_pubsub::WaveEvent;
use wave_rpc::{channel_pair, FrameSink, FrameSource, MethodTable, RpcEndpoint, DEFAULT_ROUTE};
use wave_store::WaveStore;

use crate::auth::TokenAuth;
use crate::config::ServerConfig;
use crate::coord;
use crate::dispatcher::build_method_table;
use crate::error::ServerResult;
use crate::router::build_router;
use crate::state::ServerState;
use crate::transport::{self, ConnectionLimit};

/// Wave backend server.
///
/// Cheap to clone; clones share state. Must be created inside a tokio
/// runtime since it starts the in-process default route right away.
#[derive(Clone)]
pub struct WaveServer {
    state: Arc<ServerState>,
    table: Arc<MethodTable>,
    local: RpcEndpoint,
    ws_limit: ConnectionLimit,
    shutdown: Arc<watch::Sender<bool>>,
    next_peer: Arc<AtomicU64>,
}

impl WaveServer {
    /// Server over a fresh in-memory store.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let auth = Arc::new(TokenAuth::new(config.resolve_auth_key()?));
        Self::with_state(ServerState::new(config, WaveStore::in_memory(), auth))
    }

    /// Server over prepared state. Makes sure the initial client, window
    /// and tab exist before anything can connect.
    pub fn with_state(state: ServerState) -> ServerResult<Self> {
        let state = Arc::new(state);
        let table = build_method_table(&state);
        table.validate()?;
        let table = Arc::new(table);

        let (created, updates) = state.store.with_update_context(coord::ensure_initial_data)?;
        if created {
            info!(objects = updates.len(), "initial data created");
        }
        state.broker.send_update_events(&updates);

        let local = spawn_default_route(&state, &table)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            ws_limit: ConnectionLimit::new(state.config.max_connections),
            state,
            table,
            local,
            shutdown: Arc::new(shutdown),
            next_peer: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn method_table(&self) -> &Arc<MethodTable> {
        &self.table
    }

    /// Trusted in-process client. Calls on it are served by the method
    /// table; events subscribed through it arrive on
    /// [`local_events`](Self::local_events).
    pub fn local_client(&self) -> &RpcEndpoint {
        &self.local
    }

    pub fn local_events(&self) -> broadcast::Receiver<WaveEvent> {
        self.state.subscribe_local()
    }

    /// Build the HTTP router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.clone())
    }

    pub(crate) fn ws_limit(&self) -> &ConnectionLimit {
        &self.ws_limit
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn peer_name(&self, transport: &str) -> String {
        format!("{transport}:{}", self.next_peer.fetch_add(1, Ordering::Relaxed))
    }

    /// Serve a peer that must authenticate before calling anything but the
    /// unauthenticated methods.
    pub fn attach_peer<S, K>(&self, source: S, sink: K, name: impl Into<String>) -> RpcEndpoint
    where
        S: FrameSource,
        K: FrameSink,
    {
        let endpoint = RpcEndpoint::spawn(
            source,
            sink,
            self.table.clone(),
            self.state.config.endpoint_config(name),
        );
        endpoint.attach_router(&self.state.router);
        endpoint
    }

    /// Serve a trusted peer registered as `route_id` from the start.
    pub fn attach_trusted_peer<S, K>(&self, source: S, sink: K, route_id: &str) -> ServerResult<RpcEndpoint>
    where
        S: FrameSource,
        K: FrameSink,
    {
        let endpoint = RpcEndpoint::spawn(
            source,
            sink,
            self.table.clone(),
            self.state.config.endpoint_config(route_id).trusted(),
        );
        if let Err(e) = self.state.router.register_route(route_id, &endpoint, false) {
            endpoint.close();
            return Err(e.into());
        }
        Ok(endpoint)
    }

    /// Bind the configured listeners and start serving in the background.
    pub async fn start(&self) -> ServerResult<ServerHandle> {
        let mut tasks = Vec::new();

        #[cfg(unix)]
        let socket_path = match self.state.config.socket_path() {
            Some(path) => {
                let listener = transport::unix::bind(&path)?;
                info!(path = %path.display(), "domain socket listening");
                tasks.push(tokio::spawn(transport::unix::accept_loop(listener, self.clone())));
                Some(path)
            }
            None => None,
        };
        #[cfg(not(unix))]
        let socket_path = None;

        let listener = TcpListener::bind(self.state.config.ws_bind_addr).await?;
        let ws_addr = listener.local_addr()?;
        info!(addr = %ws_addr, "websocket listening");
        let app = build_router(self.clone());
        let mut shutdown = self.shutdown_signal();
        tasks.push(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        }));

        let stdio = if self.state.config.enable_stdio {
            Some(transport::stdio::attach(self)?)
        } else {
            None
        };

        Ok(ServerHandle {
            server: self.clone(),
            ws_addr,
            socket_path,
            stdio,
            tasks,
        })
    }

    /// Serve until interrupted, or until the stdio peer goes away.
    pub async fn serve(self) -> ServerResult<()> {
        let mut handle = self.start().await?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("interrupt received, shutting down");
            }
            _ = handle.stdio_closed() => info!("stdio peer closed, shutting down"),
        }
        handle.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for WaveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveServer")
            .field("state", &self.state)
            .field("methods", &self.table.len())
            .finish()
    }
}

/// Connect the default route to the method table over an in-process pair.
///
/// The router maps a route to the endpoint facing that peer, so the
/// client half is what gets registered; calls routed to `wavesrv` cross
/// the pair and are served by the dispatching half.
fn spawn_default_route(state: &Arc<ServerState>, table: &Arc<MethodTable>) -> ServerResult<RpcEndpoint> {
    let ((server_src, server_sink), (client_src, client_sink)) =
        channel_pair(state.config.outgoing_queue_capacity);
    let dispatcher = RpcEndpoint::spawn(
        server_src,
        server_sink,
        table.clone(),
        state.config.endpoint_config("local").trusted(),
    );
    dispatcher.set_route_id(DEFAULT_ROUTE);
    dispatcher.attach_router(&state.router);

    let client = RpcEndpoint::spawn(
        client_src,
        client_sink,
        Arc::new(MethodTable::new()),
        state.config.endpoint_config("local-client").trusted(),
    );
    state.router.register_route(DEFAULT_ROUTE, &client, true)?;
    Ok(client)
}

/// Handle to a started server. Dropping it stops the listeners.
pub struct ServerHandle {
    server: WaveServer,
    ws_addr: SocketAddr,
    socket_path: Option<PathBuf>,
    stdio: Option<RpcEndpoint>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn server(&self) -> &WaveServer {
        &self.server
    }

    /// Resolves when the stdio peer closes; never if there is none.
    pub async fn stdio_closed(&self) {
        match &self.stdio {
            Some(endpoint) => endpoint.closed().await,
            None => std::future::pending().await,
        }
    }

    /// Stop accepting, close every connection and wait for the listeners
    /// to finish.
    pub async fn shutdown(&mut self) {
        self.server.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.remove_socket();
        info!("server stopped");
    }

    fn remove_socket(&mut self) {
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.remove_socket();
    }
}
