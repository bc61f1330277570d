//! Status and trigger endpoints.

use super::AppState;
use crate::daemon::triggers::TriggerRequest;
use crate::registry::ProjectRegistry;
use crate::status::StatusReport;
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

type ApiError = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let config = state.config.clone();
    let report = tokio::task::spawn_blocking(move || StatusReport::collect(&config, Utc::now()))
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// POST /trigger
///
/// Body is optional; `{"project": "<name>"}` limits the run to one project.
pub async fn trigger(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let project = match &request.project {
        Some(key) => {
            let registry = ProjectRegistry::load(&state.config.state_paths().registry())
                .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            let project = registry
                .get(key)
                .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Project not found: {key}")))?;
            Some(project.name.clone())
        }
        None => None,
    };

    info!(project = ?project, "Trigger requested over HTTP");
    state
        .triggers
        .try_send(TriggerRequest {
            project: project.clone(),
        })
        .map_err(|e| {
            warn!("Trigger rejected: {}", e);
            error(StatusCode::SERVICE_UNAVAILABLE, "daemon is busy, retry later")
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            status: "accepted".to_string(),
            project,
        }),
    ))
}
