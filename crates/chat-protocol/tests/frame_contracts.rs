//! Contract tests pinning the exact JSON shape of every server-to-client
//! frame and persisted record.  Clients and the shared store depend on these
//! spellings; a failing test here means a wire-visible break.

use chat_protocol::{
    BroadcastEnvelope, BroadcastFrame, BroadcastLevel, ByeFrame, EchoReply, ErrorEnvelope,
    HeartbeatFrame, MessageRecord, SessionData, BYE_MESSAGE,
};
use serde_json::json;

#[test]
fn echo_reply_shape() {
    let frame = EchoReply {
        count: 2,
        echo: "world".to_owned(),
    };
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({"count": 2, "echo": "world"})
    );
}

#[test]
fn heartbeat_frame_shape() {
    let frame = HeartbeatFrame {
        ts: "2026-08-01T12:00:00+00:00".to_owned(),
    };
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({"ts": "2026-08-01T12:00:00+00:00"})
    );
}

#[test]
fn broadcast_frame_shape() {
    let frame = BroadcastFrame::new(
        "maint in 5m".to_owned(),
        "System Message".to_owned(),
        BroadcastLevel::Warning,
        1_700_000_000_000,
    );
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({
            "type": "broadcast",
            "message": "maint in 5m",
            "title": "System Message",
            "level": "warning",
            "timestamp": 1_700_000_000_000_i64,
        })
    );
}

#[test]
fn bye_frame_shape() {
    let frame = ByeFrame::new(7);
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({"bye": true, "total": 7, "message": BYE_MESSAGE})
    );
}

#[test]
fn session_data_round_trip() {
    let data = SessionData {
        count: 3,
        created_at: 1_700_000_000,
        last_activity: 1_700_000_060,
    };
    let text = serde_json::to_string(&data).unwrap();
    let back: SessionData = serde_json::from_str(&text).unwrap();
    assert_eq!(back, data);
}

#[test]
fn sent_message_record_shape() {
    let record = MessageRecord {
        content: "hello".to_owned(),
        timestamp_ms: 1_700_000_000_000,
        is_sent: true,
        session_id: "s1".to_owned(),
        is_broadcast: None,
        broadcast_level: None,
    };
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({
            "content": "hello",
            "timestamp_ms": 1_700_000_000_000_i64,
            "is_sent": true,
            "session_id": "s1",
        })
    );
}

#[test]
fn broadcast_message_record_shape() {
    let record = MessageRecord {
        content: "maint in 5m".to_owned(),
        timestamp_ms: 1_700_000_000_000,
        is_sent: false,
        session_id: "s2".to_owned(),
        is_broadcast: Some(true),
        broadcast_level: Some(BroadcastLevel::Warning),
    };
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({
            "content": "maint in 5m",
            "timestamp_ms": 1_700_000_000_000_i64,
            "is_sent": false,
            "session_id": "s2",
            "is_broadcast": true,
            "broadcast_level": "warning",
        })
    );
}

#[test]
fn broadcast_envelope_round_trip() {
    let env = BroadcastEnvelope {
        message: "maint in 5m".to_owned(),
        title: "System Message".to_owned(),
        level: BroadcastLevel::Error,
        timestamp_ms: 1_700_000_000_000,
        id: "abcd1234".to_owned(),
    };
    let text = serde_json::to_string(&env).unwrap();
    let back: BroadcastEnvelope = serde_json::from_str(&text).unwrap();
    assert_eq!(back, env);
}

#[test]
fn error_envelope_shape() {
    let env = ErrorEnvelope::new("BAD_REQUEST", "message is required");
    assert_eq!(
        serde_json::to_value(&env).unwrap(),
        json!({
            "success": false,
            "error": {"code": "BAD_REQUEST", "message": "message is required"},
        })
    );
}

#[test]
fn unknown_record_fields_are_tolerated() {
    // Older instances must be able to read records written by newer ones.
    let record: MessageRecord = serde_json::from_value(json!({
        "content": "hi",
        "timestamp_ms": 1_i64,
        "is_sent": true,
        "session_id": "s1",
        "future_field": {"x": 1},
    }))
    .expect("extra fields should be ignored");
    assert_eq!(record.content, "hi");
}
