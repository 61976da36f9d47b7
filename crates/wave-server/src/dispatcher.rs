//! The server's method surface.
//!
//! Each method is an async function over the shared [`ServerState`],
//! registered once in [`build_method_table`]. Mutating methods run their
//! store work in one transaction bounded by the call's deadline and publish
//! the resulting updates only after it commits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use wave_protocol::methods::{
    self, AuthenticateRequest, AuthenticateResponse, BlockControllerStatus, BlockIdRequest,
    BlockInfoResponse, ConnStatus, ControllerInputRequest, ControllerResyncRequest,
    CreateBlockRequest, CreateTabRequest,
    DeleteTabRequest, EventReadHistoryRequest, MessageRequest, ORefRequest, ResolveIdsRequest,
    ResolveIdsResponse, RouteAnnounceRequest, SetMetaRequest, SetViewRequest, StreamTestRequest,
};
use wave_pubsub::{events, SubscriptionRequest, WaveEvent};
use wave_rpc::{CallContext, MethodTable, RpcError, RpcResult, StreamSender, DEFAULT_ROUTE};
use wave_store::{StoreError, StoreResult, Tx};
use wave_types::{Block, MetaMap, ORef, WaveObj};

use crate::auth::route_for_claims;
use crate::controllers::BlockInput;
use crate::coord;
use crate::state::ServerState;

/// Build the table of every method the server answers.
pub fn build_method_table(state: &Arc<ServerState>) -> MethodTable {
    MethodTable::new()
        .unary(methods::AUTHENTICATE, bind(state, authenticate))
        .unary(methods::ROUTE_ANNOUNCE, bind(state, route_announce))
        .unary(methods::GET_OBJECT, bind(state, get_object))
        .unary(methods::GET_META, bind(state, get_meta))
        .unary(methods::SET_META, bind(state, set_meta))
        .unary(methods::RESOLVE_IDS, bind(state, resolve_ids))
        .unary(methods::CREATE_BLOCK, bind(state, create_block))
        .unary(methods::DELETE_BLOCK, bind(state, delete_block))
        .unary(methods::CREATE_TAB, bind(state, create_tab))
        .unary(methods::DELETE_TAB, bind(state, delete_tab))
        .unary(methods::SET_VIEW, bind(state, set_view))
        .unary(methods::BLOCK_INFO, bind(state, block_info))
        .unary(methods::EVENT_PUBLISH, bind(state, event_publish))
        .unary(methods::EVENT_SUB, bind(state, event_sub))
        .unary(methods::EVENT_UNSUB, bind(state, event_unsub))
        .unary(methods::EVENT_UNSUB_ALL, bind(state, event_unsub_all))
        .unary(methods::EVENT_READ_HISTORY, bind(state, event_read_history))
        .unary(methods::EVENT_RECV, bind(state, event_recv))
        .unary(methods::CONTROLLER_STOP, bind(state, controller_stop))
        .unary(methods::CONTROLLER_RESYNC, bind(state, controller_resync))
        .unary(methods::CONTROLLER_STATUS, bind(state, controller_status))
        .unary(methods::CONTROLLER_INPUT, bind(state, controller_input))
        .unary(methods::SET_CONFIG, bind(state, set_config))
        .unary(methods::CONN_STATUS, bind(state, conn_status))
        .unary(methods::CONN_ENSURE, bind(state, conn_ensure))
        .unary(methods::CONN_CONNECT, bind(state, conn_connect))
        .unary(methods::CONN_DISCONNECT, bind(state, conn_disconnect))
        .unary(methods::CONN_REINSTALL_WSH, bind(state, conn_reinstall_wsh))
        .unary(methods::CONN_LIST, bind(state, conn_list))
        .unary(methods::MESSAGE, bind(state, message))
        .unary(methods::TEST, bind(state, test))
        .stream(methods::STREAM_TEST, bind_stream(state, stream_test))
        .allow_unauthenticated(methods::AUTHENTICATE)
        .allow_unauthenticated(methods::RESOLVE_IDS)
}

fn bind<Req, F, Fut>(
    state: &Arc<ServerState>,
    f: F,
) -> impl Fn(CallContext, Req) -> Fut + Send + Sync + 'static
where
    Req: 'static,
    F: Fn(Arc<ServerState>, CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: 'static,
{
    let state = state.clone();
    move |ctx: CallContext, req: Req| f(state.clone(), ctx, req)
}

fn bind_stream<Req, F, Fut>(
    state: &Arc<ServerState>,
    f: F,
) -> impl Fn(CallContext, Req, StreamSender) -> Fut + Send + Sync + 'static
where
    Req: 'static,
    F: Fn(Arc<ServerState>, CallContext, Req, StreamSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<()>> + 'static,
{
    let state = state.clone();
    move |ctx: CallContext, req: Req, tx: StreamSender| f(state.clone(), ctx, req, tx)
}

/// Read-only store access under the call's deadline.
fn read<T, F>(state: &ServerState, ctx: &CallContext, f: F) -> RpcResult<T>
where
    F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
{
    let (value, _) = state
        .store
        .with_update_context_deadline(ctx.store_deadline(), f)?;
    Ok(value)
}

/// Mutating store access; updates go out once the transaction commits.
fn write<T, F>(state: &ServerState, ctx: &CallContext, f: F) -> RpcResult<T>
where
    F: FnOnce(&mut Tx<'_>) -> StoreResult<T>,
{
    let (value, updates) = state
        .store
        .with_update_context_deadline(ctx.store_deadline(), f)?;
    let sent = state.broker.send_update_events(&updates);
    debug!(method = %ctx.command, updates = sent, "store updates published");
    Ok(value)
}

fn caller_route(ctx: &CallContext) -> RpcResult<String> {
    ctx.route_id()
        .ok_or_else(|| RpcError::BadRequest(format!("{}: caller has no route", ctx.command)))
}

fn require_window(tx: &mut Tx<'_>, tab_id: &str) -> StoreResult<String> {
    tx.find_window_for_tab(tab_id)?
        .ok_or_else(|| StoreError::InvalidObject {
            oref: ORef::tab(tab_id),
            reason: "tab is not shown in any window".into(),
        })
}

/// Stop the closed block's controller in the background and announce the
/// close to the block and its tab. The stop waits for a free worker rather
/// than being dropped.
fn block_closed(state: &ServerState, tab_id: &str, block_id: &str) {
    let blocks = state.blocks.clone();
    let id = block_id.to_string();
    state.tasks.spawn("controller-stop", async move {
        if let Err(e) = blocks.stop(&id).await {
            warn!(block = %id, error = %e, "stopping controller failed");
        }
    });
    let event = WaveEvent::new(events::BLOCK_CLOSE)
        .with_scope(ORef::tab(tab_id).to_string())
        .with_scope(ORef::block(block_id).to_string())
        .with_data(json!(block_id));
    if let Err(e) = state.broker.publish(event) {
        warn!(block = %block_id, error = %e, "blockclose not published");
    }
}

// ----------------------------------------------------------------------
// Routes
// ----------------------------------------------------------------------

async fn authenticate(
    state: Arc<ServerState>,
    ctx: CallContext,
    req: AuthenticateRequest,
) -> RpcResult<AuthenticateResponse> {
    let claims = state.auth.authenticate(&req.token).await?;
    let (route_id, exclusive) = route_for_claims(&claims)?;
    state
        .router
        .register_route(&route_id, &ctx.endpoint, exclusive)?;
    ctx.endpoint.mark_authenticated(&route_id, claims);
    info!(route = %route_id, endpoint = %ctx.endpoint.name(), "peer authenticated");
    Ok(AuthenticateResponse { route_id })
}

/// Routes only the server or a verified token can hand out.
fn is_reserved_route(route_id: &str) -> bool {
    route_id == DEFAULT_ROUTE || route_id.starts_with("conn:")
}

/// A peer announcing a route it proxies for. The id must not be reserved
/// or held by another live peer.
async fn route_announce(
    state: Arc<ServerState>,
    ctx: CallContext,
    req: RouteAnnounceRequest,
) -> RpcResult<()> {
    if is_reserved_route(&req.route_id) {
        warn!(route = %req.route_id, endpoint = %ctx.endpoint.name(), "announce of a reserved route refused");
        return Err(RpcError::RouteConflict(req.route_id));
    }
    state.router.claim_route(&req.route_id, &ctx.endpoint)
}

// ----------------------------------------------------------------------
// Objects
// ----------------------------------------------------------------------

async fn get_object(state: Arc<ServerState>, ctx: CallContext, req: ORefRequest) -> RpcResult<WaveObj> {
    read(&state, &ctx, |tx| tx.must_get_obj(&req.oref))
}

async fn get_meta(state: Arc<ServerState>, ctx: CallContext, req: ORefRequest) -> RpcResult<MetaMap> {
    read(&state, &ctx, |tx| Ok(tx.must_get_obj(&req.oref)?.meta().clone()))
}

async fn set_meta(state: Arc<ServerState>, ctx: CallContext, req: SetMetaRequest) -> RpcResult<()> {
    debug!(oref = %req.oref, keys = req.meta.len(), "setmeta");
    write(&state, &ctx, |tx| tx.update_meta(&req.oref, &req.meta, false)).map(|_| ())
}

async fn resolve_ids(
    state: Arc<ServerState>,
    ctx: CallContext,
    req: ResolveIdsRequest,
) -> RpcResult<ResolveIdsResponse> {
    let resolved_ids = read(&state, &ctx, |tx| {
        coord::resolve_ids(tx, req.block_id.as_deref(), &req.ids)
    })?;
    Ok(ResolveIdsResponse { resolved_ids })
}

async fn create_block(
    state: Arc<ServerState>,
    ctx: CallContext,
    req: CreateBlockRequest,
) -> RpcResult<ORef> {
    let block = write(&state, &ctx, |tx| {
        require_window(tx, &req.tab_id)?;
        coord::create_block(tx, &req.tab_id, req.block_def, req.runtime_opts)
    })?;
    let view = block
        .meta
        .get_str(coord::META_VIEW)
        .unwrap_or_default()
        .to_string();
    let counters = state.tasks.counters().clone();
    state.tasks.try_spawn("renderer-count", async move {
        counters.record_renderer(&view);
    });
    Ok(ORef::block(&block.oid))
}

async fn delete_block(state: Arc<ServerState>, ctx: CallContext, req: BlockIdRequest) -> RpcResult<()> {
    let tab_id = write(&state, &ctx, |tx| {
        if let Some(tab_id) = tx.find_tab_for_block(&req.block_id)? {
            require_window(tx, &tab_id)?;
        }
        coord::delete_block(tx, &req.block_id)
    })?;
    block_closed(&state, &tab_id, &req.block_id);
    Ok(())
}

async fn create_tab(state: Arc<ServerState>, ctx: CallContext, req: CreateTabRequest) -> RpcResult<ORef> {
    let tab = write(&state, &ctx, |tx| {
        coord::create_tab(tx, &req.workspace_id, req.name.as_deref(), req.activate)
    })?;
    Ok(ORef::tab(&tab.oid))
}

async fn delete_tab(state: Arc<ServerState>, ctx: CallContext, req: DeleteTabRequest) -> RpcResult<()> {
    let deleted = write(&state, &ctx, |tx| {
        coord::delete_tab(tx, &req.workspace_id, &req.tab_id)
    })?;
    for block_id in &deleted {
        block_closed(&state, &req.tab_id, block_id);
    }
    Ok(())
}

async fn set_view(state: Arc<ServerState>, ctx: CallContext, req: SetViewRequest) -> RpcResult<()> {
    debug!(block = %req.block_id, view = %req.view, "setview");
    write(&state, &ctx, |tx| coord::set_view(tx, &req.block_id, &req.view)).map(|_| ())
}

async fn block_info(
    state: Arc<ServerState>,
    ctx: CallContext,
    req: BlockIdRequest,
) -> RpcResult<BlockInfoResponse> {
    read(&state, &ctx, |tx| {
        let block = tx.must_get::<Block>(&req.block_id)?;
        let tab_id = tx.find_tab_for_block(&req.block_id)?;
        let window_id = match &tab_id {
            Some(tab_id) => tx.find_window_for_tab(tab_id)?,
            None => None,
        };
        Ok(BlockInfoResponse {
            block_id: req.block_id.clone(),
            tab_id,
            window_id,
            block,
        })
    })
}

// ----------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------

async fn event_publish(state: Arc<ServerState>, ctx: CallContext, mut event: WaveEvent) -> RpcResult<()> {
    let route = caller_route(&ctx)?;
    if event.sender.as_deref().map_or(true, str::is_empty) {
        event.sender = Some(route);
    }
    state.broker.publish(event)?;
    Ok(())
}

async fn event_sub(state: Arc<ServerState>, ctx: CallContext, req: SubscriptionRequest) -> RpcResult<()> {
    let route = caller_route(&ctx)?;
    state.broker.subscribe(&route, req)?;
    Ok(())
}

async fn event_unsub(state: Arc<ServerState>, ctx: CallContext, event: String) -> RpcResult<()> {
    let route = caller_route(&ctx)?;
    state.broker.unsubscribe(&route, &event);
    Ok(())
}

async fn event_unsub_all(state: Arc<ServerState>, ctx: CallContext, _req: ()) -> RpcResult<()> {
    let route = caller_route(&ctx)?;
    state.broker.unsubscribe_all(&route);
    Ok(())
}

async fn event_read_history(
    state: Arc<ServerState>,
    _ctx: CallContext,
    req: EventReadHistoryRequest,
) -> RpcResult<Vec<WaveEvent>> {
    Ok(state
        .broker
        .read_event_history(&req.event, &req.scope, req.max_items))
}

/// Events pushed to the default route end up here and are handed to
/// in-process observers. Anything else calling it is ignored.
async fn event_recv(state: Arc<ServerState>, ctx: CallContext, event: WaveEvent) -> RpcResult<()> {
    if ctx.route_id().as_deref() == Some(DEFAULT_ROUTE) {
        state.deliver_local(event);
    } else {
        debug!(route = ?ctx.route_id(), event = %event.event, "eventrecv from a peer ignored");
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Controllers
// ----------------------------------------------------------------------

async fn controller_stop(state: Arc<ServerState>, _ctx: CallContext, req: BlockIdRequest) -> RpcResult<()> {
    state.blocks.stop(&req.block_id).await?;
    Ok(())
}

async fn controller_resync(
    state: Arc<ServerState>,
    ctx: CallContext,
    req: ControllerResyncRequest,
) -> RpcResult<()> {
    let tab_id = read(&state, &ctx, |tx| {
        tx.find_tab_for_block(&req.block_id)?
            .ok_or_else(|| StoreError::NotFound(ORef::block(&req.block_id)))
    })?;
    if req.force_restart {
        state.blocks.stop(&req.block_id).await?;
    }
    state
        .blocks
        .resync(&tab_id, &req.block_id, req.runtime_opts)
        .await?;
    Ok(())
}

async fn controller_status(
    state: Arc<ServerState>,
    _ctx: CallContext,
    req: BlockIdRequest,
) -> RpcResult<Option<BlockControllerStatus>> {
    Ok(state.blocks.status(&req.block_id).await)
}

async fn controller_input(
    state: Arc<ServerState>,
    _ctx: CallContext,
    req: ControllerInputRequest,
) -> RpcResult<()> {
    let data = match req.input_data64.as_deref() {
        Some(encoded) => BASE64
            .decode(encoded)
            .map_err(|e| RpcError::BadRequest(format!("inputdata64: {e}")))?,
        None => Vec::new(),
    };
    let input = BlockInput {
        data,
        sig_name: req.sig_name,
        term_size: req.term_size,
    };
    state.blocks.send_input(&req.block_id, input).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Settings and connections
// ----------------------------------------------------------------------

async fn set_config(state: Arc<ServerState>, ctx: CallContext, update: MetaMap) -> RpcResult<()> {
    let settings = state.update_settings(&update);
    info!(source = ?ctx.route_id(), keys = update.len(), "settings updated");
    state
        .broker
        .publish(WaveEvent::new(events::CONFIG).with_data(json!({ "settings": settings })))?;
    Ok(())
}

async fn conn_status(state: Arc<ServerState>, _ctx: CallContext, _req: ()) -> RpcResult<Vec<ConnStatus>> {
    Ok(state.conns.status().await)
}

async fn conn_ensure(state: Arc<ServerState>, _ctx: CallContext, conn: String) -> RpcResult<()> {
    Ok(state.conns.ensure(&conn).await?)
}

async fn conn_connect(state: Arc<ServerState>, _ctx: CallContext, conn: String) -> RpcResult<()> {
    Ok(state.conns.connect(&conn).await?)
}

async fn conn_disconnect(state: Arc<ServerState>, _ctx: CallContext, conn: String) -> RpcResult<()> {
    Ok(state.conns.disconnect(&conn).await?)
}

async fn conn_reinstall_wsh(state: Arc<ServerState>, _ctx: CallContext, conn: String) -> RpcResult<()> {
    Ok(state.conns.reinstall_wsh(&conn).await?)
}

async fn conn_list(state: Arc<ServerState>, _ctx: CallContext, _req: ()) -> RpcResult<Vec<String>> {
    Ok(state.conns.list().await?)
}

// ----------------------------------------------------------------------
// Diagnostics
// ----------------------------------------------------------------------

async fn message(_state: Arc<ServerState>, ctx: CallContext, req: MessageRequest) -> RpcResult<()> {
    info!(source = ?ctx.route_id(), oref = ?req.oref, message = %req.message, "message");
    Ok(())
}

async fn test(_state: Arc<ServerState>, ctx: CallContext, data: Value) -> RpcResult<()> {
    info!(source = ?ctx.route_id(), data = %data, "test");
    Ok(())
}

async fn stream_test(
    _state: Arc<ServerState>,
    _ctx: CallContext,
    req: StreamTestRequest,
    tx: StreamSender,
) -> RpcResult<()> {
    for i in 1..=req.count {
        tx.send(&i).await?;
        if i < req.count {
            tokio::time::sleep(Duration::from_millis(req.interval_ms)).await;
        }
    }
    Ok(())
}
