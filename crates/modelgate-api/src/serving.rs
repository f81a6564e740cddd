//! Serving-path hooks: version resolution and outcome reporting.
//!
//! `route` only reads the router's current snapshot, so it keeps answering
//! while a slot is mid-transition.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use modelgate_router::RouteError;

use crate::handlers::{error_response, respond, ApiResponse};
use crate::ApiState;

/// GET /api/v1/route/{slot}/{session_key}
pub async fn route(
    State(state): State<ApiState>,
    Path((slot, session_key)): Path<(String, String)>,
) -> Response {
    match state.controller.router().assign(&slot, &session_key) {
        Ok(assignment) => ApiResponse::ok(assignment).into_response(),
        Err(e @ RouteError::UnknownSlot(_)) => {
            error_response("not_found", &e.to_string(), StatusCode::NOT_FOUND)
        }
        Err(e @ RouteError::NoActiveVersion(_)) => {
            error_response("unavailable", &e.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// One observed outcome for a served request.
#[derive(serde::Deserialize)]
pub struct OutcomeRequest {
    pub session_key: String,
    /// Version that served the request. Resolved from `session_key` when
    /// absent.
    #[serde(default)]
    pub version_id: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

/// POST /api/v1/slots/{id}/outcomes
pub async fn record_outcome(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<OutcomeRequest>,
) -> Response {
    if let Some((name, _)) = req.metrics.iter().find(|(_, v)| !v.is_finite()) {
        return error_response(
            "invalid_outcome",
            &format!("metric {name} is not finite"),
            StatusCode::BAD_REQUEST,
        );
    }
    respond(state.controller.record_outcome(
        &id,
        &req.session_key,
        req.version_id.as_deref(),
        &req.metrics,
    ))
}
