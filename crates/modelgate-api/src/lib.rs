//! modelgate-api — REST API for the release controller.
//!
//! Operator endpoints read and drive slots through the
//! [`Controller`](modelgate_rollout::Controller); the serving hook resolves
//! session keys to versions straight from the router's snapshots.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/slots` | List slot status |
//! | GET | `/api/v1/slots/{id}` | Slot status |
//! | GET | `/api/v1/slots/{id}/history` | Version history |
//! | GET | `/api/v1/slots/{id}/report` | Markdown quality report |
//! | POST | `/api/v1/slots/{id}/check` | Poll the feed now |
//! | POST | `/api/v1/slots/{id}/promote` | Force-promote a version |
//! | POST | `/api/v1/slots/{id}/reject` | Force-reject a version |
//! | POST | `/api/v1/slots/{id}/rollback` | Roll back to the previous version |
//! | POST | `/api/v1/slots/{id}/outcomes` | Report a serving outcome |
//! | GET | `/api/v1/route/{slot}/{session_key}` | Resolve a request to a version |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod serving;

use axum::Router;
use axum::routing::{get, post};
use modelgate_rollout::Controller;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Controller,
}

/// Build the complete API router (operator surface + serving hook + metrics).
pub fn build_router(controller: Controller) -> Router {
    let state = ApiState { controller };

    let api_routes = Router::new()
        .route("/slots", get(handlers::list_slots))
        .route("/slots/{id}", get(handlers::get_slot))
        .route("/slots/{id}/history", get(handlers::slot_history))
        .route("/slots/{id}/report", get(handlers::slot_report))
        .route("/slots/{id}/check", post(handlers::force_check))
        .route("/slots/{id}/promote", post(handlers::force_promote))
        .route("/slots/{id}/reject", post(handlers::force_reject))
        .route("/slots/{id}/rollback", post(handlers::rollback))
        .route("/slots/{id}/outcomes", post(serving::record_outcome))
        .route("/route/{slot}/{session_key}", get(serving::route))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
