//! Operator endpoints.
//!
//! Each handler calls one controller operation and wraps the result in the
//! common JSON envelope. Controller errors map to HTTP status by their code.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use modelgate_rollout::{ControlError, ControlResult};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            code: None,
            error: None,
        })
    }
}

pub(crate) fn error_response(code: &'static str, msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            code: Some(code),
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn status_for(e: &ControlError) -> StatusCode {
    match e {
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::InvalidTransition(_) => StatusCode::CONFLICT,
        ControlError::RollbackUnavailable { .. } | ControlError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ControlError::Storage(_) | ControlError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn respond<T: serde::Serialize>(result: ControlResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(code = e.code(), error = %e, "operator request failed");
            }
            error_response(e.code(), &e.to_string(), status)
        }
    }
}

/// Body of promote / reject requests.
#[derive(serde::Deserialize)]
pub struct VersionRequest {
    pub version_id: String,
}

// ── Slots ──────────────────────────────────────────────────────

/// GET /api/v1/slots
pub async fn list_slots(State(state): State<ApiState>) -> Response {
    respond(state.controller.list_status())
}

/// GET /api/v1/slots/{id}
pub async fn get_slot(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.controller.status(&id))
}

/// GET /api/v1/slots/{id}/history
pub async fn slot_history(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.controller.history(&id))
}

/// GET /api/v1/slots/{id}/report
pub async fn slot_report(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.controller.report(&id) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/markdown; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => respond::<()>(Err(e)),
    }
}

// ── Operator commands ──────────────────────────────────────────

/// POST /api/v1/slots/{id}/check
pub async fn force_check(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.controller.force_check(&id).await)
}

/// POST /api/v1/slots/{id}/promote
pub async fn force_promote(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<VersionRequest>,
) -> Response {
    respond(state.controller.force_promote(&id, &req.version_id).await)
}

/// POST /api/v1/slots/{id}/reject
pub async fn force_reject(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<VersionRequest>,
) -> Response {
    respond(state.controller.force_reject(&id, &req.version_id).await)
}

/// POST /api/v1/slots/{id}/rollback
pub async fn rollback(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.controller.rollback(&id).await)
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    match state.controller.prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => respond::<()>(Err(e)),
    }
}
