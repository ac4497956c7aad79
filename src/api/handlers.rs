//! HTTP routes

use super::types::HealthResponse;
use super::ws::ws_handler;
use super::AppState;
use axum::{extract::State, routing::get, Json, Router};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Event channel
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/version", get(get_version))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.sessions.active_sessions().await,
    })
}

async fn get_version() -> &'static str {
    concat!("medipredict ", env!("CARGO_PKG_VERSION"))
}
