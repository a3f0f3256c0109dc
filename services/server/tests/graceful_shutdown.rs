//! Graceful shutdown: every open connection gets a bye frame, the socket
//! closes with code 1001, and the drain stays within its deadline.

use chat_test_utils::MockWsClient;
use server::store::{KvStore, MemoryStore};
use server::{shutdown, AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn spawn_server(config: Config) -> (SocketAddr, AppState) {
    let store = Arc::new(MemoryStore::new(config.max_message_history));
    let state = AppState::new(config, store);
    server::spawn_background_tasks(&state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    state.set_ready(true);
    (addr, state)
}

#[tokio::test]
async fn all_connections_get_bye_and_close_1001() {
    let (addr, state) = spawn_server(Config::default()).await;

    let mut clients = Vec::new();
    for i in 0..5 {
        let url = format!("ws://{addr}/ws/chat/?session=shutdown-{i}&redis_persistence=true");
        let mut client = MockWsClient::connect(&url).await.unwrap();
        client.send_text("hello").await.unwrap();
        assert_eq!(client.recv_json().await.unwrap()["count"], 1);
        clients.push(client);
    }
    assert_eq!(state.registry.len().await, 5);

    let started = Instant::now();
    let drain = tokio::spawn(shutdown::graceful(state.clone()));

    for mut client in clients {
        let (code, frames) =
            tokio::time::timeout(Duration::from_secs(5), client.recv_until_close())
                .await
                .expect("server should close the socket during shutdown")
                .unwrap();
        assert_eq!(code, Some(1001), "server-initiated close uses going-away");

        let bye: serde_json::Value = serde_json::from_str(
            frames.last().expect("a bye frame precedes the close"),
        )
        .unwrap();
        assert_eq!(bye["bye"], true);
        assert_eq!(bye["total"], 1);
        assert_eq!(bye["message"], "Server is shutting down gracefully");
    }

    drain.await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed <= Duration::from_secs(12),
        "shutdown took {elapsed:?}"
    );

    // Shutdown flips readiness and records exactly one histogram sample.
    assert!(!state.is_ready());
    let metrics = state.metrics.render();
    assert!(metrics.contains("app_shutdown_duration_seconds_count 1"));
}

#[tokio::test]
async fn readyz_reports_not_ready_once_shutdown_begins() {
    let (addr, state) = spawn_server(Config::default()).await;

    let ready = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();
    assert_eq!(ready.status(), 200);
    let body: serde_json::Value = ready.json().await.unwrap();
    assert_eq!(body["ready"], true);

    shutdown::graceful(state.clone()).await;

    let not_ready = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();
    assert_eq!(not_ready.status(), 503);
    let body: serde_json::Value = not_ready.json().await.unwrap();
    assert_eq!(body["ready"], false);

    // The liveness probe keeps answering through the drain.
    let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn final_counter_is_persisted_during_drain() {
    let (addr, state) = spawn_server(Config::default()).await;

    let url = format!("ws://{addr}/ws/chat/?session=drain-1&redis_persistence=true");
    let mut client = MockWsClient::connect(&url).await.unwrap();
    client.send_text("one").await.unwrap();
    client.send_text("two").await.unwrap();
    client.recv_json().await.unwrap();
    client.recv_json().await.unwrap();

    shutdown::graceful(state.clone()).await;
    let (_code, _frames) = client.recv_until_close().await.unwrap();

    let session = state
        .store
        .session_get("drain-1")
        .await
        .unwrap()
        .expect("session survives the drain");
    assert_eq!(session.count, 2);
}
