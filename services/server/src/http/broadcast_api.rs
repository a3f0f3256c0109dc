//! Admin broadcast endpoint.

use crate::broadcast::BroadcastError;
use crate::http::response::bad_request;
use crate::state::AppState;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use chat_protocol::{BroadcastLevel, BroadcastRequest, DEFAULT_BROADCAST_TITLE};

pub async fn post_broadcast(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let Some(message) = body.get("message").and_then(serde_json::Value::as_str) else {
        return bad_request("message is required");
    };
    let title = body
        .get("title")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(DEFAULT_BROADCAST_TITLE)
        .to_owned();
    let level = match body.get("level").and_then(serde_json::Value::as_str) {
        None => BroadcastLevel::default(),
        Some(raw) => match BroadcastLevel::parse(raw) {
            Some(level) => level,
            None => {
                return bad_request(format!(
                    "level must be one of info, warning, error, success (got '{raw}')"
                ))
            }
        },
    };

    let request = BroadcastRequest {
        message: message.to_owned(),
        title,
        level,
    };
    match state.broadcaster.broadcast(&request).await {
        Ok(sessions_updated) => Json(serde_json::json!({
            "success": true,
            "sessions_updated": sessions_updated,
        }))
        .into_response(),
        Err(BroadcastError::InvalidMessage(reason)) => bad_request(reason),
    }
}
