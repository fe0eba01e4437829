// Module: http
// Signaling WebSocket, HLS static files and the health probe

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use relaycast_sfu::{EncodingPreset, SfuManager};

/// Which parts of the relay are running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Features {
    pub webrtc: bool,
    pub hls: bool,
    pub ffmpeg: bool,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    pub features: Features,
    pub preset: EncodingPreset,
    /// Largest signaling frame accepted, in bytes
    pub max_message_size: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, hls_dir: &Path) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route("/ws", get(websocket::websocket_handler))
        .nest_service("/hls", ServeDir::new(hls_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
