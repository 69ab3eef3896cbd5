//! Route definitions

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{api_status, chat, health, model_info, reload, AppState};
use super::websocket::ws_chat;

/// Create the API router
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Status and model management
        .route("/api/status", get(api_status))
        .route("/api/model/info", get(model_info))
        .route("/api/model/reload", post(reload))
        // Generation
        .route("/api/chat", post(chat))
        .route("/ws/chat", get(ws_chat))
}
