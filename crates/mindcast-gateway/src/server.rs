//! Axum-based HTTP + WebSocket server.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use mindcast_core::publish_json;

use crate::relay::ResultRelay;
use crate::session::handle_ws_connection;
use crate::state::GatewayState;
use crate::sweeper::PendingSweeper;

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws/{user_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/updates", post(publish_update_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind to the configured address and run the gateway until `cancel` fires.
pub async fn start_gateway(
    state: Arc<GatewayState>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.gateway_bind());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve_gateway(state, listener, cancel).await
}

/// Run the result relay, the sweeper and the HTTP server on `listener`.
///
/// The relay subscribes before the first client can connect, so no result
/// published for a session of this process is missed.
pub async fn serve_gateway(
    state: Arc<GatewayState>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let relay = ResultRelay::new(state.registry.clone(), state.channels.clone());
    let subscription = relay.subscribe(state.bus.as_ref()).await?;
    let relay_task = relay.spawn(subscription, cancel.child_token());

    let sweeper_task = state.config.pending_ttl().map(|ttl| {
        PendingSweeper::new(state.registry.clone(), ttl, state.config.sweep_interval())
            .spawn(cancel.child_token())
    });

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;

    // Stop the background workers whether the server exited cleanly or not.
    cancel.cancel();
    let _ = relay_task.await;
    if let Some(task) = sweeper_task {
        let _ = task.await;
    }
    info!("Gateway stopped");

    result.map_err(Into::into)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, user_id, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let connections = state.registry.connection_count().await;
    let pending = state.registry.pending_count().await;

    Json(json!({
        "status": "ok",
        "version": version,
        "connections": connections,
        "pending_requests": pending,
    }))
}

/// Publish an arbitrary domain update; every connected client receives it.
async fn publish_update_handler(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match publish_json(state.bus.as_ref(), &state.channels.updates, &body).await {
        Ok(published) => (StatusCode::OK, Json(json!({ "published": published }))),
        Err(e) => {
            error!(%e, "Failed to publish domain update");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
