//! Health check endpoint
//!
//! Reports what is running and the current room statistics.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use relaycast_sfu::ManagerStats;

use crate::http::{AppState, Features};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    /// `LOW_RESOURCE` or `NORMAL`
    pub mode: &'static str,
    pub features: Features,
    pub stats: ManagerStats,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        timestamp: Utc::now(),
        mode: state.preset.label(),
        features: state.features,
        stats: state.manager.stats(),
    })
}
