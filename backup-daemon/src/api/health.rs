//! Health check endpoint.

use super::AppState;
use crate::daemon::heartbeat::assess;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.config;
    let (status, _) = assess(&config.state_paths().heartbeat(), Utc::now(), &config.watchdog);

    Json(json!({
        "status": "ok",
        "daemon": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}
