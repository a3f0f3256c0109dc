pub mod broadcast;
pub mod config;
pub mod heartbeat;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod ws_chat;

pub use config::Config;
pub use state::AppState;

use axum::{
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(http::health::healthz))
        .route("/readyz", get(http::health::readyz))
        .route("/metrics", get(http::metrics::get_metrics))
        .route("/ws/chat/", get(ws_chat::ws_chat_handler))
        .route("/chat/api/redis/status/", get(http::sessions::redis_status))
        .route(
            "/chat/api/sessions/:session_id/",
            get(http::sessions::get_session),
        )
        .route(
            "/chat/api/sessions/:session_id/messages/",
            get(http::sessions::get_session_messages),
        )
        .route(
            "/chat/api/sessions/:session_id/extend/",
            post(http::sessions::extend_session),
        )
        .route(
            "/chat/api/sessions/:session_id/delete/",
            delete(http::sessions::delete_session),
        )
        .route(
            "/chat/api/broadcast/",
            post(http::broadcast_api::post_broadcast),
        )
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn the background tasks that accompany the router: the heartbeat
/// publisher and the broadcast pub/sub subscriber.
pub fn spawn_background_tasks(state: &AppState) {
    heartbeat::spawn(state.clone(), state.shutdown_rx());
    std::sync::Arc::clone(&state.broadcaster).spawn_subscriber(state.shutdown_rx());
}

async fn fallback_404() -> impl IntoResponse {
    http::response::not_found("no such route")
}
