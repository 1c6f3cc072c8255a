//! HTTP surface: health endpoint and the WebSocket upgrade.

use std::sync::Arc;

use poem::web::websocket::WebSocket;
use poem::web::{Data, Json, Query};
use poem::{EndpointExt, IntoResponse, Route, get, handler, middleware::Cors};
use serde::Deserialize;

use crate::gateway::context::GatewayContext;
use crate::gateway::janitor;
use crate::gateway::transport::run_transport;
use crate::gateway::types::HealthResponse;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session id for reconnection, carried in the connection handshake.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[handler]
async fn health(Data(ctx): Data<&Arc<GatewayContext>>) -> Json<HealthResponse> {
    let queue = ctx.queue.state();
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: ctx.registry.len(),
        uptime: ctx.uptime().as_secs(),
        memory: janitor::read_memory_usage(),
        queued_commands: queue.pending,
        running_commands: queue.running,
    })
}

#[handler]
fn terminal(
    ws: WebSocket,
    Data(ctx): Data<&Arc<GatewayContext>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let ctx = ctx.clone();
    ws.on_upgrade(move |socket| run_transport(socket, ctx, query.session_id))
}

/// Assemble the application routes with CORS and shared state.
pub fn build_app(ctx: Arc<GatewayContext>) -> impl poem::Endpoint {
    let mut cors = Cors::new();
    for origin in &ctx.config.cors_origins {
        cors = cors.allow_origin(origin.as_str());
    }

    Route::new()
        .at("/health", get(health))
        .at("/ws", get(terminal))
        .with(cors)
        .data(ctx)
}
