use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use wave_protocol::methods;
use wave_pubsub::{events, EventBroker, EventSink, WaveEvent};

use crate::endpoint::{ResponseStream, RpcEndpoint, RpcOpts};
use crate::error::{RpcError, RpcResult};

/// Route of the process's own in-process peer.
pub const DEFAULT_ROUTE: &str = "wavesrv";

pub fn conn_route(conn_name: &str) -> String {
    format!("conn:{conn_name}")
}

pub fn proc_route(proc_id: &str) -> String {
    format!("proc:{proc_id}")
}

pub fn controller_route(block_id: &str) -> String {
    format!("controller:{block_id}")
}

/// Scope `route:gone` events are published under.
pub fn route_scope(route_id: &str) -> String {
    format!("route:{route_id}")
}

struct RouteEntry {
    endpoint: RpcEndpoint,
    exclusive: bool,
}

/// Directory of reachable peers.
///
/// Maps route ids to the endpoint facing that peer, whatever transport the
/// endpoint runs over. Also the broker's delivery sink: events for a route
/// are pushed to its endpoint as `eventrecv` calls.
pub struct RpcRouter {
    routes: RwLock<HashMap<String, RouteEntry>>,
    broker: Arc<EventBroker>,
}

impl RpcRouter {
    /// Create a router and install it as `broker`'s delivery sink.
    pub fn new(broker: Arc<EventBroker>) -> Arc<Self> {
        let router = Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
            broker,
        });
        let sink: Arc<dyn EventSink> = router.clone();
        router.broker.set_sink(&sink);
        router
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RouteEntry>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RouteEntry>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `endpoint` reachable as `route_id`.
    ///
    /// Fails while another live endpoint holds the id and either side asked
    /// for exclusivity. Otherwise the mapping is added or replaced. The
    /// route is removed again when the endpoint closes.
    pub fn register_route(
        self: &Arc<Self>,
        route_id: &str,
        endpoint: &RpcEndpoint,
        exclusive: bool,
    ) -> RpcResult<()> {
        self.register(route_id, endpoint, exclusive, true)
    }

    /// Register a shared route only if no other live endpoint holds it.
    pub fn claim_route(self: &Arc<Self>, route_id: &str, endpoint: &RpcEndpoint) -> RpcResult<()> {
        self.register(route_id, endpoint, false, false)
    }

    fn register(
        self: &Arc<Self>,
        route_id: &str,
        endpoint: &RpcEndpoint,
        exclusive: bool,
        replace_shared: bool,
    ) -> RpcResult<()> {
        if route_id.is_empty() {
            return Err(RpcError::BadRequest("empty route id".into()));
        }
        let replaced = {
            let mut routes = self.write();
            if let Some(existing) = routes.get_mut(route_id) {
                if existing.endpoint.ptr_eq(endpoint) {
                    existing.exclusive |= exclusive;
                    return Ok(());
                }
                let taken = exclusive || existing.exclusive || !replace_shared;
                if taken && !existing.endpoint.is_closed() {
                    return Err(RpcError::RouteConflict(route_id.to_string()));
                }
            }
            routes
                .insert(
                    route_id.to_string(),
                    RouteEntry {
                        endpoint: endpoint.clone(),
                        exclusive,
                    },
                )
                .map(|old| old.endpoint)
        };
        if let Some(old) = replaced {
            debug!(route = %route_id, old = %old.name(), "route replaced");
        }

        endpoint.attach_router(self);
        endpoint.set_route_id(route_id);
        let router = Arc::downgrade(self);
        let id = route_id.to_string();
        let endpoint_id = endpoint.id();
        endpoint.on_close(move || {
            if let Some(router) = router.upgrade() {
                router.unregister_if_owned(&id, endpoint_id);
            }
        });
        info!(route = %route_id, endpoint = %endpoint.name(), exclusive, "route registered");
        Ok(())
    }

    /// Remove a route, drop its subscriptions and announce `route:gone`.
    /// Returns false if the route was not registered.
    pub fn unregister_route(&self, route_id: &str) -> bool {
        let removed = self.write().remove(route_id).is_some();
        if removed {
            self.route_gone(route_id);
        }
        removed
    }

    /// Close-hook path: only remove the route if it still points at the
    /// endpoint that closed, not at a later registration under the same id.
    fn unregister_if_owned(&self, route_id: &str, endpoint_id: u64) {
        let removed = {
            let mut routes = self.write();
            match routes.get(route_id) {
                Some(entry) if entry.endpoint.id() == endpoint_id => routes.remove(route_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.route_gone(route_id);
        }
    }

    fn route_gone(&self, route_id: &str) {
        let dropped = self.broker.unsubscribe_all(route_id);
        let event = WaveEvent::new(events::ROUTE_GONE)
            .with_scope(route_scope(route_id))
            .with_data(json!({ "routeid": route_id }));
        if let Err(e) = self.broker.publish(event) {
            warn!(route = %route_id, error = %e, "route:gone publish failed");
        }
        info!(route = %route_id, subscriptions = dropped, "route unregistered");
    }

    /// Live endpoint for `route_id`.
    pub fn get_endpoint(&self, route_id: &str) -> Option<RpcEndpoint> {
        self.read()
            .get(route_id)
            .filter(|entry| !entry.endpoint.is_closed())
            .map(|entry| entry.endpoint.clone())
    }

    pub fn has_route(&self, route_id: &str) -> bool {
        self.get_endpoint(route_id).is_some()
    }

    pub fn is_exclusive(&self, route_id: &str) -> bool {
        self.read().get(route_id).is_some_and(|entry| entry.exclusive)
    }

    pub fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn lookup(&self, route_id: &str) -> RpcResult<RpcEndpoint> {
        self.get_endpoint(route_id)
            .ok_or_else(|| RpcError::RouteNotFound(route_id.to_string()))
    }

    /// Send a call to the peer behind `route_id`.
    pub async fn route_command(
        &self,
        route_id: &str,
        command: &str,
        data: Value,
        opts: RpcOpts,
    ) -> RpcResult<Value> {
        let endpoint = self.lookup(route_id)?;
        endpoint
            .send_command(command, data, RpcOpts { route: None, ..opts })
            .await
    }

    /// Start a streaming call to the peer behind `route_id`.
    pub async fn route_stream(
        &self,
        route_id: &str,
        command: &str,
        data: Value,
        opts: RpcOpts,
    ) -> RpcResult<ResponseStream> {
        let endpoint = self.lookup(route_id)?;
        endpoint
            .send_stream(command, data, RpcOpts { route: None, ..opts })
            .await
    }
}

impl EventSink for RpcRouter {
    fn deliver(&self, route_id: &str, event: &WaveEvent) {
        let Some(endpoint) = self.get_endpoint(route_id) else {
            debug!(route = %route_id, event = %event.event, "no live route for event");
            return;
        };
        let data = match serde_json::to_value(event) {
            Ok(data) => data,
            Err(e) => {
                warn!(event = %event.event, error = %e, "event not serializable");
                return;
            }
        };
        if !endpoint.try_notify(methods::EVENT_RECV, data) {
            warn!(route = %route_id, event = %event.event, "subscriber queue full, event dropped");
        }
    }
}

impl std::fmt::Debug for RpcRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRouter")
            .field("routes", &self.route_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::endpoint::EndpointConfig;
    use crate::table::MethodTable;
    use crate::transport::channel_pair;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wave_pubsub::SubscriptionRequest;

    struct Peer {
        /// Server-side endpoint, the one the router holds.
        facing: RpcEndpoint,
        /// The peer's own endpoint.
        remote: RpcEndpoint,
    }

    fn peer(name: &str, router: &Arc<RpcRouter>, remote_table: MethodTable) -> Peer {
        let (a, b) = channel_pair(16);
        let server_table = MethodTable::new().unary("echo", |ctx: CallContext, v: Value| async move {
            Ok(json!({ "from": ctx.route_id(), "data": v }))
        });
        let facing = RpcEndpoint::spawn(
            a.0,
            a.1,
            Arc::new(server_table),
            EndpointConfig::named(format!("{name}-facing")).trusted(),
        );
        facing.attach_router(router);
        let remote = RpcEndpoint::spawn(
            b.0,
            b.1,
            Arc::new(remote_table),
            EndpointConfig::named(name).trusted(),
        );
        Peer { facing, remote }
    }

    fn router() -> Arc<RpcRouter> {
        RpcRouter::new(Arc::new(EventBroker::default()))
    }

    #[tokio::test]
    async fn exclusive_route_rejects_second_registration() {
        let router = router();
        let a = peer("a", &router, MethodTable::new());
        let b = peer("b", &router, MethodTable::new());

        router.register_route("conn:local", &a.facing, true).unwrap();
        let err = router.register_route("conn:local", &b.facing, true).unwrap_err();
        assert_eq!(err, RpcError::RouteConflict("conn:local".into()));
        assert!(router.get_endpoint("conn:local").unwrap().ptr_eq(&a.facing));

        assert!(router.unregister_route("conn:local"));
        router.register_route("conn:local", &b.facing, true).unwrap();
        assert!(router.get_endpoint("conn:local").unwrap().ptr_eq(&b.facing));
    }

    #[tokio::test]
    async fn shared_registration_cannot_take_an_exclusive_route() {
        let router = router();
        let a = peer("a", &router, MethodTable::new());
        let b = peer("b", &router, MethodTable::new());

        router.register_route(DEFAULT_ROUTE, &a.facing, true).unwrap();
        let err = router.register_route(DEFAULT_ROUTE, &b.facing, false).unwrap_err();
        assert_eq!(err, RpcError::RouteConflict(DEFAULT_ROUTE.into()));
        assert!(router.get_endpoint(DEFAULT_ROUTE).unwrap().ptr_eq(&a.facing));
        assert!(router.is_exclusive(DEFAULT_ROUTE));
        assert!(!a.facing.is_closed());

        // the holder may re-register itself
        router.register_route(DEFAULT_ROUTE, &a.facing, true).unwrap();
        a.facing.close();
        router.register_route(DEFAULT_ROUTE, &b.facing, false).unwrap();
        assert!(router.get_endpoint(DEFAULT_ROUTE).unwrap().ptr_eq(&b.facing));
    }

    #[tokio::test]
    async fn claimed_route_is_not_taken_from_a_live_holder() {
        let router = router();
        let a = peer("a", &router, MethodTable::new());
        let b = peer("b", &router, MethodTable::new());

        router.claim_route("proc:x", &a.facing).unwrap();
        let err = router.claim_route("proc:x", &b.facing).unwrap_err();
        assert_eq!(err, RpcError::RouteConflict("proc:x".into()));
        router.claim_route("proc:x", &a.facing).unwrap();
        assert!(router.get_endpoint("proc:x").unwrap().ptr_eq(&a.facing));

        a.facing.close();
        router.claim_route("proc:x", &b.facing).unwrap();
        assert!(router.get_endpoint("proc:x").unwrap().ptr_eq(&b.facing));
    }

    #[tokio::test]
    async fn non_exclusive_registration_replaces() {
        let router = router();
        let a = peer("a", &router, MethodTable::new());
        let b = peer("b", &router, MethodTable::new());
        router.register_route("proc:1", &a.facing, false).unwrap();
        router.register_route("proc:1", &b.facing, false).unwrap();
        assert!(router.get_endpoint("proc:1").unwrap().ptr_eq(&b.facing));
        assert!(!router.is_exclusive("proc:1"));

        // the replaced endpoint closing must not remove the new mapping
        a.facing.close();
        assert!(router.has_route("proc:1"));
    }

    #[tokio::test]
    async fn closed_exclusive_holder_can_be_replaced() {
        let router = router();
        let a = peer("a", &router, MethodTable::new());
        let b = peer("b", &router, MethodTable::new());
        router.register_route("conn:ssh", &a.facing, true).unwrap();
        a.facing.close();
        assert!(!router.has_route("conn:ssh"));
        router.register_route("conn:ssh", &b.facing, true).unwrap();
    }

    #[tokio::test]
    async fn route_command_reaches_the_peer() {
        let router = router();
        let table = MethodTable::new().unary("ping", |_ctx, n: u32| async move { Ok(n + 1) });
        let p = peer("p", &router, table);
        router.register_route("proc:p", &p.facing, false).unwrap();

        let v = router
            .route_command("proc:p", "ping", json!(41), RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(v, json!(42));

        let err = router
            .route_command("proc:gone", "ping", json!(1), RpcOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::RouteNotFound("proc:gone".into()));
    }

    #[tokio::test]
    async fn frames_with_a_route_are_forwarded() {
        let router = router();
        let target_table = MethodTable::new().unary("ping", |ctx: CallContext, n: u32| async move {
            Ok(json!({ "n": n, "source": ctx.source }))
        });
        let target = peer("target", &router, target_table);
        router.register_route("proc:target", &target.facing, false).unwrap();
        let caller = peer("caller", &router, MethodTable::new());
        router.register_route("conn:caller", &caller.facing, false).unwrap();

        let v = caller
            .remote
            .send_command("ping", json!(7), RpcOpts::default().with_route("proc:target"))
            .await
            .unwrap();
        assert_eq!(v, json!({ "n": 7, "source": "conn:caller" }));

        let err = caller
            .remote
            .send_command("ping", json!(7), RpcOpts::default().with_route("proc:none"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RouteNotFound(_)));
    }

    #[tokio::test]
    async fn subscribed_route_receives_events() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = MethodTable::new().unary("eventrecv", move |_ctx, event: WaveEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        });
        let p = peer("p", &router, table);
        router.register_route("conn:p", &p.facing, false).unwrap();
        router
            .broker()
            .subscribe("conn:p", SubscriptionRequest::new("blockfile").with_scope("block:b1"))
            .unwrap();

        let delivered = router
            .broker()
            .publish(WaveEvent::new("blockfile").with_scope("block:b1").with_data(json!("chunk")))
            .unwrap();
        assert_eq!(delivered, 1);
        router
            .broker()
            .publish(WaveEvent::new("blockfile").with_scope("block:b2"))
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.scopes, vec!["block:b1".to_string()]);
        assert_eq!(got.data, json!("chunk"));
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn closing_endpoint_unregisters_and_drops_subscriptions() {
        let router = router();
        let watcher = peer("watcher", &router, MethodTable::new());
        router.register_route("conn:watcher", &watcher.facing, false).unwrap();
        router
            .broker()
            .subscribe(
                "conn:watcher",
                SubscriptionRequest::new(events::ROUTE_GONE).with_scope(route_scope("conn:gone")),
            )
            .unwrap();

        let gone = peer("gone", &router, MethodTable::new());
        router.register_route("conn:gone", &gone.facing, true).unwrap();
        router
            .broker()
            .subscribe("conn:gone", SubscriptionRequest::new("blockfile").all_scopes())
            .unwrap();
        assert_eq!(router.broker().subscriber_count(), 2);

        gone.remote.close();
        gone.facing.closed().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while router.has_route("conn:gone") || router.route_ids().contains(&"conn:gone".to_string()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(router.broker().subscriber_count(), 1);
        assert_eq!(router.broker().read_event_history(events::ROUTE_GONE, "route:conn:gone", 1).len(), 1);
    }
}
