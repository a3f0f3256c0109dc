//! Per-connection WebSocket state machine.
//!
//! A connection moves through Handshaking -> Open -> Draining -> Closed.
//! The task owns the socket exclusively; everything arriving from outside
//! (heartbeats, broadcasts, shutdown, displacement) comes in through the
//! connection's event channel, so socket writes are naturally serialized.

use crate::registry::{ConnEvent, ConnectionHandle, EVENT_QUEUE_CAPACITY};
use crate::state::AppState;
use crate::store::KvStore;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use chat_protocol::{ByeFrame, EchoReply, HeartbeatFrame, MessageRecord, SessionData};
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// WebSocket close code 1001: the server is going away.
const GOING_AWAY: u16 = 1001;

/// How long the drain phase waits for the bye frame to flush.
const BYE_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);

/// Recognized query parameters; anything else is ignored.
#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    session: Option<String>,
    redis_persistence: Option<String>,
}

pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
) -> impl IntoResponse {
    let session_id = query.session.filter(|s| !s.is_empty());
    let use_persistence = query.redis_persistence.as_deref() == Some("true");
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, session_id, use_persistence))
}

async fn handle_chat_socket(
    mut socket: WebSocket,
    state: AppState,
    session_id: Option<String>,
    use_persistence: bool,
) {
    let conn_id = Uuid::new_v4();

    // Resume the counter from the store when the session is still alive.
    let mut count: u64 = 0;
    let mut created_at: Option<i64> = None;
    if let Some(id) = &session_id {
        match state.store.session_get(id).await {
            Ok(Some(session)) => {
                count = session.count;
                created_at = Some(session.created_at);
            }
            Ok(None) => {}
            Err(e) => {
                state.metrics.errors_total.inc();
                warn!(session_id = %id, error = %e, "session lookup failed, starting at zero");
            }
        }
    }

    let (event_tx, mut events) = broadcast::channel(EVENT_QUEUE_CAPACITY);
    if let Some(id) = &session_id {
        if let Some(displaced) = state
            .registry
            .add(id, ConnectionHandle::new(conn_id, event_tx.clone()))
            .await
        {
            debug!(session_id = %id, "displacing older connection for session");
            displaced.send(ConnEvent::Replaced);
        }
        state
            .metrics
            .sessions_tracked
            .set(state.registry.len().await as i64);
    }
    // Keeps the event channel open for anonymous connections too.
    let _event_tx = event_tx;

    // Make the session visible in the store right away, so broadcasts reach
    // it even if this connection never sends a message.
    if let Some(id) = &session_id {
        write_session(&state, id, count, &mut created_at).await;
    }

    state.metrics.connections_opened.inc();
    state.metrics.active_connections.inc();
    info!(
        conn_id = %conn_id,
        session_id = session_id.as_deref().unwrap_or("-"),
        persistence = use_persistence,
        "connection open"
    );

    let drain_guard = state.drain_guard();
    let mut shutdown_rx = state.shutdown_rx();

    // A connection accepted mid-shutdown drains immediately.
    if state.is_shutting_down() {
        drain(&mut socket, &state, &session_id, use_persistence, count, created_at).await;
    } else {
        loop {
            tokio::select! {
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Text(payload))) => {
                            count += 1;
                            if !echo_and_persist(
                                &mut socket,
                                &state,
                                &session_id,
                                use_persistence,
                                count,
                                &mut created_at,
                                payload.to_string(),
                            )
                            .await
                            {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = socket.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(conn_id = %conn_id, "client closed connection");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary and pong frames carry nothing for this layer.
                        }
                        Some(Err(e)) => {
                            state.metrics.errors_total.inc();
                            warn!(conn_id = %conn_id, error = %e, "read failed, closing connection");
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(ConnEvent::Heartbeat { ts }) => {
                            // Heartbeat delivery is best-effort: a failed write is
                            // counted, the read side decides when the socket is dead.
                            match send_json(&mut socket, &HeartbeatFrame { ts }).await {
                                Ok(()) => state.metrics.messages_sent.inc(),
                                Err(()) => state.metrics.errors_total.inc(),
                            }
                        }
                        Ok(ConnEvent::Broadcast(frame)) => {
                            match send_json(&mut socket, &frame).await {
                                Ok(()) => state.metrics.messages_sent.inc(),
                                Err(()) => {
                                    state.metrics.errors_total.inc();
                                    warn!(conn_id = %conn_id, "broadcast write failed, closing connection");
                                    break;
                                }
                            }
                        }
                        Ok(ConnEvent::Shutdown) => {
                            drain(&mut socket, &state, &session_id, use_persistence, count, created_at).await;
                            break;
                        }
                        Ok(ConnEvent::Replaced) => {
                            info!(conn_id = %conn_id, "session taken over by a newer connection");
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Producers outpaced this connection; the oldest
                            // queued frames were dropped.
                            state.metrics.errors_total.inc_by(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        drain(&mut socket, &state, &session_id, use_persistence, count, created_at).await;
                        break;
                    }
                }
            }
        }
    }

    // Closed: unregister and settle the gauges.
    if let Some(id) = &session_id {
        state.registry.remove(id, conn_id).await;
        state
            .metrics
            .sessions_tracked
            .set(state.registry.len().await as i64);
    }
    state.metrics.active_connections.dec();
    state.metrics.connections_closed.inc();
    drop(drain_guard);
    info!(conn_id = %conn_id, total = count, "connection closed");
}

/// Echo the payload back, then write the message record and session state.
/// Returns `false` when the socket write failed and the connection must close.
async fn echo_and_persist(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &Option<String>,
    use_persistence: bool,
    count: u64,
    created_at: &mut Option<i64>,
    payload: String,
) -> bool {
    state.metrics.messages_total.inc();

    let reply = EchoReply {
        count,
        echo: payload.clone(),
    };
    if send_json(socket, &reply).await.is_err() {
        state.metrics.errors_total.inc();
        warn!("echo write failed, closing connection");
        return false;
    }
    state.metrics.messages_sent.inc();

    let Some(id) = session_id else {
        return true;
    };

    if use_persistence {
        let record = MessageRecord {
            content: payload,
            timestamp_ms: Utc::now().timestamp_millis(),
            is_sent: true,
            session_id: id.clone(),
            is_broadcast: None,
            broadcast_level: None,
        };
        if let Err(e) = state
            .store
            .messages_append(id, &record, state.config.session_ttl)
            .await
        {
            state.metrics.errors_total.inc();
            warn!(session_id = %id, error = %e, "message persistence failed");
        }
    }

    // The session counter is written back whether or not message history is
    // enabled, so a reconnect resumes counting.
    write_session(state, id, count, created_at).await;
    true
}

async fn write_session(state: &AppState, id: &str, count: u64, created_at: &mut Option<i64>) {
    let now = Utc::now().timestamp();
    let session = SessionData {
        count,
        created_at: *created_at.get_or_insert(now),
        last_activity: now,
    };
    if let Err(e) = state
        .store
        .session_put(id, &session, state.config.session_ttl)
        .await
    {
        state.metrics.errors_total.inc();
        warn!(session_id = %id, error = %e, "session write failed");
    }
}

/// Draining: bye frame, bounded flush, one final session write, close 1001.
async fn drain(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &Option<String>,
    use_persistence: bool,
    count: u64,
    mut created_at: Option<i64>,
) {
    let bye = ByeFrame::new(count);
    match serde_json::to_string(&bye) {
        Ok(json) => {
            match tokio::time::timeout(BYE_FLUSH_TIMEOUT, socket.send(Message::Text(json.into())))
                .await
            {
                Ok(Ok(())) => state.metrics.messages_sent.inc(),
                _ => state.metrics.errors_total.inc(),
            }
        }
        Err(e) => warn!(error = %e, "failed to encode bye frame"),
    }

    if let (Some(id), true) = (session_id, use_persistence) {
        write_session(state, id, count, &mut created_at).await;
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: GOING_AWAY,
            reason: "server shutting down".into(),
        })))
        .await;
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, frame: &T) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
