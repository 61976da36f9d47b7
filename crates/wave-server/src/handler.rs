use axum::extract::State;
use axum::response::Json;
use serde_json::json;

use wave_protocol::HealthResponse;
use wave_rpc::DEFAULT_ROUTE;

use crate::server::WaveServer;

/// Health check handler.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Server identity plus a snapshot of routes and background activity.
pub async fn info_handler(State(server): State<WaveServer>) -> Json<serde_json::Value> {
    let state = server.state();
    let counters = state.tasks.counters();
    Json(json!({
        "name": DEFAULT_ROUTE,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": wave_protocol::PROTOCOL_VERSION,
        "methods": server.method_table().len(),
        "routes": state.router.route_ids(),
        "subscribers": state.broker.subscriber_count(),
        "tasks": {
            "spawned": counters.spawned(),
            "queued": counters.queued(),
            "completed": counters.completed(),
            "rejected": counters.rejected(),
            "panics": counters.panics(),
        },
        "renderers": counters.renderers(),
    }))
}
