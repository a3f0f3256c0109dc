//! Liveness and readiness probes.
//!
//! `/healthz` answers 200 as soon as the process serves HTTP at all.
//! `/readyz` answers 200 only between "listener bound + broadcast subscriber
//! running" and the first shutdown signal, so the traffic switcher drains
//! this instance before connections are told to leave.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        )
    }
}
