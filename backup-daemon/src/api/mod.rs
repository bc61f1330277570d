//! Local HTTP status and trigger channel.
//!
//! Bound to loopback by default. Mirrors the state files for clients that
//! prefer HTTP and accepts trigger requests as an alternative to touching
//! the trigger file.

pub mod control;
pub mod health;

use crate::config::Config;
use crate::daemon::triggers::TriggerRequest;
use crate::ws::EventBus;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub events: EventBus,
    pub config: Arc<Config>,
    /// Requests forwarded to the daemon loop
    pub triggers: mpsc::Sender<TriggerRequest>,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, events: EventBus, triggers: mpsc::Sender<TriggerRequest>) -> Self {
        Self {
            events,
            config,
            triggers,
            started: Instant::now(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/status", get(control::status))
        .route("/trigger", post(control::trigger))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
