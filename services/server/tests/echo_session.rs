//! End-to-end echo, counter and resume behavior over a real listener.

use chat_test_utils::MockWsClient;
use server::store::{KvStore, MemoryStore};
use server::{AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

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
async fn echo_carries_a_monotonic_counter_and_persists() {
    let (addr, state) = spawn_server(Config::default()).await;
    let url = format!("ws://{addr}/ws/chat/?session=s1&redis_persistence=true");
    let mut client = MockWsClient::connect(&url).await.unwrap();

    client.send_text("hello").await.unwrap();
    let reply = client.recv_json().await.unwrap();
    assert_eq!(reply["count"], 1);
    assert_eq!(reply["echo"], "hello");

    client.send_text("world").await.unwrap();
    let reply = client.recv_json().await.unwrap();
    assert_eq!(reply["count"], 2);
    assert_eq!(reply["echo"], "world");

    let session = state
        .store
        .session_get("s1")
        .await
        .unwrap()
        .expect("session should be persisted");
    assert_eq!(session.count, 2);

    let messages = state.store.messages_range("s1", 0, -1).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.is_sent && m.session_id == "s1"));
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].content, "world");
}

#[tokio::test]
async fn reconnect_resumes_the_counter() {
    let (addr, _state) = spawn_server(Config::default()).await;
    let url = format!("ws://{addr}/ws/chat/?session=resume-1&redis_persistence=true");

    let mut first = MockWsClient::connect(&url).await.unwrap();
    first.send_text("one").await.unwrap();
    first.send_text("two").await.unwrap();
    assert_eq!(first.recv_json().await.unwrap()["count"], 1);
    assert_eq!(first.recv_json().await.unwrap()["count"], 2);
    first.close().await.unwrap();

    // Give the server a moment to notice the close and unregister.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = MockWsClient::connect(&url).await.unwrap();
    second.send_text("again").await.unwrap();
    let reply = second.recv_json().await.unwrap();
    assert_eq!(reply["count"], 3);
    assert_eq!(reply["echo"], "again");
}

#[tokio::test]
async fn identical_payloads_are_stored_as_distinct_records() {
    let (addr, state) = spawn_server(Config::default()).await;
    let url = format!("ws://{addr}/ws/chat/?session=dup-1&redis_persistence=true");
    let mut client = MockWsClient::connect(&url).await.unwrap();

    client.send_text("same").await.unwrap();
    client.recv_json().await.unwrap();
    client.send_text("same").await.unwrap();
    client.recv_json().await.unwrap();

    let messages = state.store.messages_range("dup-1", 0, -1).await.unwrap();
    assert_eq!(messages.len(), 2, "client messages must never be deduped");
    assert_eq!(messages[0].content, "same");
    assert_eq!(messages[1].content, "same");
}

#[tokio::test]
async fn counter_restarts_after_ttl_expiry() {
    let config = Config {
        session_ttl: Duration::from_secs(1),
        ..Config::default()
    };
    let (addr, _state) = spawn_server(config).await;
    let url = format!("ws://{addr}/ws/chat/?session=ttl-1&redis_persistence=true");

    let mut first = MockWsClient::connect(&url).await.unwrap();
    first.send_text("before").await.unwrap();
    assert_eq!(first.recv_json().await.unwrap()["count"], 1);
    first.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let mut second = MockWsClient::connect(&url).await.unwrap();
    second.send_text("after").await.unwrap();
    let reply = second.recv_json().await.unwrap();
    assert_eq!(reply["count"], 1, "expired session must start over");
}

#[tokio::test]
async fn anonymous_connection_echoes_without_touching_the_store() {
    let (addr, state) = spawn_server(Config::default()).await;
    let url = format!("ws://{addr}/ws/chat/");
    let mut client = MockWsClient::connect(&url).await.unwrap();

    client.send_text("hi").await.unwrap();
    let reply = client.recv_json().await.unwrap();
    assert_eq!(reply["count"], 1);
    assert_eq!(reply["echo"], "hi");

    assert!(state.store.list_session_ids().await.unwrap().is_empty());
    assert_eq!(state.registry.len().await, 0);
}

#[tokio::test]
async fn session_without_persistence_keeps_counter_but_no_history() {
    let (addr, state) = spawn_server(Config::default()).await;
    let url = format!("ws://{addr}/ws/chat/?session=nopersist-1");
    let mut client = MockWsClient::connect(&url).await.unwrap();

    client.send_text("x").await.unwrap();
    assert_eq!(client.recv_json().await.unwrap()["count"], 1);

    let session = state
        .store
        .session_get("nopersist-1")
        .await
        .unwrap()
        .expect("session counter is stored regardless of the persistence flag");
    assert_eq!(session.count, 1);
    assert!(state
        .store
        .messages_range("nopersist-1", 0, -1)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn duplicate_session_id_displaces_the_older_connection() {
    let (addr, state) = spawn_server(Config::default()).await;
    let url = format!("ws://{addr}/ws/chat/?session=takeover-1");

    let mut old = MockWsClient::connect(&url).await.unwrap();
    old.send_text("from-old").await.unwrap();
    old.recv_json().await.unwrap();

    let mut new = MockWsClient::connect(&url).await.unwrap();

    // The displaced connection is closed by the server.
    let (_code, _frames) = tokio::time::timeout(Duration::from_secs(2), old.recv_until_close())
        .await
        .expect("old connection should be closed promptly")
        .unwrap();

    // The new connection owns the session and resumes the counter.
    new.send_text("from-new").await.unwrap();
    assert_eq!(new.recv_json().await.unwrap()["count"], 2);
    assert_eq!(state.registry.len().await, 1);
}
