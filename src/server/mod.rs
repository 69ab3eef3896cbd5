//! HTTP server for inference
//!
//! Provides the batch chat API, status endpoints and the websocket stream.

mod handlers;
mod routes;
mod websocket;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use handlers::AppState;
pub use routes::api_routes;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let mut app = api_routes();

    if server.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }
    if server.request_logging {
        app = app.layer(TraceLayer::new_for_http());
    }

    app.with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start(state: Arc<AppState>, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let addr = state.config.server.addr();
    let app = router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET  /health - Health check");
    tracing::info!("  GET  /api/status - Application status");
    tracing::info!("  GET  /api/model/info - Model information");
    tracing::info!("  POST /api/model/reload - Reload the model");
    tracing::info!("  POST /api/chat - Single-response chat");
    tracing::info!("  GET  /ws/chat - Streaming chat (websocket)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
