use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use wave_protocol::endpoints;

use crate::handler;
use crate::server::WaveServer;
use crate::transport::ws;

/// Build the axum router: health, info and the websocket upgrade.
pub fn build_router(server: WaveServer) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(handler::health_handler))
        .route(endpoints::INFO, get(handler::info_handler))
        .route(endpoints::WEBSOCKET, get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}
