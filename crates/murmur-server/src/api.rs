use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use murmur_shared::types::{ChannelId, MessageId};

use crate::auth::Identity;
use crate::error::ServerError;
use crate::hub::{HistoryPage, Hub};
use crate::ws::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/channels/:channel_id/messages", get(channel_history))
        .route("/messages/:message_id", delete(delete_message))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    before: Option<MessageId>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.registry().connection_count().await,
    })
}

async fn channel_history(
    State(state): State<AppState>,
    Path(channel_id): Path<ChannelId>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<HistoryPage>, ServerError> {
    let identity = authenticate(&state, &headers).await?;
    let page = state
        .hub
        .history(&identity, channel_id, query.limit, query.before)
        .await?;
    Ok(Json(page))
}

async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
    let identity = authenticate(&state, &headers).await?;
    state.hub.delete_message(&identity, message_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ServerError> {
    state.hub.authenticate(bearer_token(headers)).await
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Start the HTTP + WebSocket server.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
