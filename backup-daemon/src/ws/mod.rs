//! WebSocket push channel for daemon events.
//!
//! Viewers that can hold a connection get phase changes, progress and cycle
//! results as they happen. The heartbeat and progress files remain the
//! primary contract; this channel only mirrors what is written there.

use crate::daemon::heartbeat::HeartbeatStatus;
use crate::executor::manifest::Outcome;
use crate::executor::phase::Phase;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Maximum number of queued messages per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DaemonEvent {
    #[serde(rename = "cycle:started")]
    CycleStarted { project: String, cycle_id: String },

    #[serde(rename = "cycle:phase")]
    PhaseChanged { project: String, phase: Phase },

    #[serde(rename = "cycle:progress")]
    Progress {
        project: String,
        phase: Phase,
        percent: u8,
        files_processed: usize,
        total_files: usize,
    },

    #[serde(rename = "cycle:completed")]
    CycleCompleted {
        project: String,
        outcome: Outcome,
        files: usize,
        archived: usize,
        databases: usize,
        errors: usize,
        duration_ms: u64,
    },

    #[serde(rename = "cycle:skipped")]
    CycleSkipped { project: String, reason: String },

    #[serde(rename = "cloud:completed")]
    CloudCompleted {
        project: String,
        success: bool,
        uploaded: usize,
        failed: usize,
    },

    #[serde(rename = "daemon:status")]
    Status { status: HeartbeatStatus },
}

/// Broadcast hub shared by the executor, scheduler and socket handlers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Send to every subscriber. Having none is normal.
    pub fn publish(&self, event: DaemonEvent) {
        if let Ok(count) = self.tx.send(event) {
            debug!("Published event to {} subscriber(s)", count);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    axum::extract::State(app_state): axum::extract::State<crate::api::AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state.events))
}

async fn handle_socket(socket: WebSocket, events: EventBus) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = events.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to serialize event: {:?}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagging, dropped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Inbound messages are ignored; the loop only notices the close
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
