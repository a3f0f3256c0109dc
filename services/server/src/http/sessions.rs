//! Session inspection and management endpoints.
//!
//! These mirror the store contents for operators and the UI: session state,
//! message history, TTL extension and deletion.  Store unavailability maps
//! to a 500 with the error envelope; an absent session is a plain 404.

use crate::http::response::{bad_request, internal_error, not_found};
use crate::state::AppState;
use crate::store::KvStore;
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

pub async fn redis_status(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.store.ping().await;
    Json(serde_json::json!({
        "success": true,
        "redis_connected": connected,
        "redis_url": state.store.url(),
        "backend": state.store.backend_kind(),
        "default_ttl": state.config.session_ttl.as_secs(),
    }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let session = match state.store.session_get(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return not_found("session not found"),
        Err(e) => {
            state.metrics.errors_total.inc();
            return internal_error(e);
        }
    };
    let remaining_ttl = state
        .store
        .session_ttl(&session_id)
        .await
        .ok()
        .flatten()
        .unwrap_or(0);

    Json(serde_json::json!({
        "success": true,
        "session_id": session_id,
        "data": {
            "data": {
                "count": session.count,
                "last_activity": session.last_activity,
            },
            "created_at": session.created_at,
            "ttl": state.config.session_ttl.as_secs(),
            "remaining_ttl": remaining_ttl,
        },
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Return only the newest `limit` records.
    limit: Option<usize>,
}

pub async fn get_session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let (start, stop) = match query.limit {
        Some(0) => return bad_request("limit must be positive"),
        Some(limit) => (-(limit as isize), -1),
        None => (0, -1),
    };
    match state.store.messages_range(&session_id, start, stop).await {
        Ok(messages) => Json(serde_json::json!({
            "success": true,
            "session_id": session_id,
            "count": messages.len(),
            "messages": messages,
        }))
        .into_response(),
        Err(e) => {
            state.metrics.errors_total.inc();
            internal_error(e)
        }
    }
}

pub async fn extend_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let ttl = match body.get("ttl").and_then(serde_json::Value::as_u64) {
        Some(ttl) if ttl > 0 => std::time::Duration::from_secs(ttl),
        Some(_) => return bad_request("ttl must be positive"),
        None => return bad_request("ttl is required"),
    };
    match state.store.session_extend(&session_id, ttl).await {
        Ok(true) => Json(serde_json::json!({
            "success": true,
            "session_id": session_id,
            "ttl": ttl.as_secs(),
        }))
        .into_response(),
        Ok(false) => not_found("session not found"),
        Err(e) => {
            state.metrics.errors_total.inc();
            internal_error(e)
        }
    }
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.session_delete(&session_id).await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "session_id": session_id,
            "deleted": true,
        }))
        .into_response(),
        Err(e) => {
            state.metrics.errors_total.inc();
            internal_error(e)
        }
    }
}
