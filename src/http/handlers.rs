use super::state::AppState;
use crate::session::{CaptureGrant, RecorderStatus, StartOutcome};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartRecordingRequest {
    /// Result of the host's capture permission prompt (default: granted)
    pub permission_granted: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StopRecordingResponse {
    /// Whether a running session was asked to stop
    pub stopping: bool,
    pub status: RecorderStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn unavailable(e: anyhow::Error) -> Response {
    error!("Coordinator unavailable: {}", e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /recording/start
pub async fn start_recording(
    State(state): State<AppState>,
    body: Option<Json<StartRecordingRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let grant = match request.permission_granted {
        Some(false) => CaptureGrant::Denied,
        _ => CaptureGrant::Granted,
    };

    let outcome = match state.coordinator.start(grant).await {
        Ok(outcome) => outcome,
        Err(e) => return unavailable(e),
    };

    let status = match &outcome {
        StartOutcome::Started { session_id } => {
            info!("Recording started: {}", session_id);
            StatusCode::OK
        }
        StartOutcome::AlreadyRecording { .. } => StatusCode::CONFLICT,
        StartOutcome::PermissionDenied => StatusCode::FORBIDDEN,
        StartOutcome::Failed { error } => {
            error!("Failed to start recording: {}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(outcome)).into_response()
}

/// POST /recording/stop
pub async fn stop_recording(State(state): State<AppState>) -> Response {
    match state.coordinator.stop().await {
        Ok(stopping) => (
            StatusCode::OK,
            Json(StopRecordingResponse {
                stopping,
                status: state.coordinator.status(),
            }),
        )
            .into_response(),
        Err(e) => unavailable(e),
    }
}

/// GET /recording/status
pub async fn get_status(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.coordinator.status())).into_response()
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
