// chat-protocol: wire types and key naming for the chat relay service.
//
// Server-to-client frames are individually shaped JSON objects; there is no
// shared discriminator field.  A client tells frames apart by their keys:
// `count`/`echo` (echo reply), `ts` (heartbeat), `type: "broadcast"`
// (broadcast) and `bye` (shutdown notice).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Key naming (normative)
// ---------------------------------------------------------------------------

/// Pub/sub channel carrying [`BroadcastEnvelope`] JSON between instances.
pub const BROADCAST_CHANNEL: &str = "broadcast";

/// Suffix of message-list keys under a session.
pub const MESSAGES_KEY_SUFFIX: &str = ":messages";

/// Key holding the session JSON for `id`.
pub fn session_key(id: &str) -> String {
    format!("session:{id}")
}

/// Key holding the message list for `id`.
pub fn messages_key(id: &str) -> String {
    format!("session:{id}{MESSAGES_KEY_SUFFIX}")
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Session state stored at `session:{id}` with a TTL.
///
/// `count` is monotonically non-decreasing for a session id as long as the
/// session has not expired between writes.  Timestamps are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub count: u64,
    pub created_at: i64,
    pub last_activity: i64,
}

/// One entry of the list stored at `session:{id}:messages`.
///
/// Client messages carry `is_sent = true`; server-originated entries
/// (broadcasts) carry `is_sent = false` plus the broadcast fields.  Records
/// are immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub content: String,
    pub timestamp_ms: i64,
    pub is_sent: bool,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_broadcast: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_level: Option<BroadcastLevel>,
}

// ---------------------------------------------------------------------------
// Broadcasts
// ---------------------------------------------------------------------------

/// Severity of an administrative broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastLevel {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

impl BroadcastLevel {
    /// The lowercase wire spelling, also used in the stable broadcast id.
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastLevel::Info => "info",
            BroadcastLevel::Warning => "warning",
            BroadcastLevel::Error => "error",
            BroadcastLevel::Success => "success",
        }
    }

    /// Parse the lowercase wire spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(BroadcastLevel::Info),
            "warning" => Some(BroadcastLevel::Warning),
            "error" => Some(BroadcastLevel::Error),
            "success" => Some(BroadcastLevel::Success),
            _ => None,
        }
    }
}

/// Default title for broadcasts that do not provide one.
pub const DEFAULT_BROADCAST_TITLE: &str = "System Message";

/// An administrative broadcast request as accepted by the broadcast API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
    #[serde(default = "default_broadcast_title")]
    pub title: String,
    #[serde(default)]
    pub level: BroadcastLevel,
}

fn default_broadcast_title() -> String {
    DEFAULT_BROADCAST_TITLE.to_owned()
}

/// The pub/sub payload on [`BROADCAST_CHANNEL`].
///
/// `id` is the stable broadcast id assigned by the coordinator that first
/// accepted the request; receivers use it to drop replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub message: String,
    pub title: String,
    pub level: BroadcastLevel,
    pub timestamp_ms: i64,
    pub id: String,
}

// ---------------------------------------------------------------------------
// Server -> client frames
// ---------------------------------------------------------------------------

/// Reply to a client text frame: `{"count": n, "echo": payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    pub count: u64,
    pub echo: String,
}

/// Periodic heartbeat: `{"ts": "<ISO-8601 with tz offset>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    pub ts: String,
}

/// Broadcast delivery frame.  The `type` field is always `"broadcast"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub title: String,
    pub level: BroadcastLevel,
    pub timestamp: i64,
}

impl BroadcastFrame {
    pub fn new(message: String, title: String, level: BroadcastLevel, timestamp_ms: i64) -> Self {
        BroadcastFrame {
            kind: "broadcast".to_owned(),
            message,
            title,
            level,
            timestamp: timestamp_ms,
        }
    }
}

impl From<&BroadcastEnvelope> for BroadcastFrame {
    fn from(env: &BroadcastEnvelope) -> Self {
        BroadcastFrame::new(
            env.message.clone(),
            env.title.clone(),
            env.level,
            env.timestamp_ms,
        )
    }
}

/// Text of the shutdown notice carried by every [`ByeFrame`].
pub const BYE_MESSAGE: &str = "Server is shutting down gracefully";

/// Final frame on a connection during graceful shutdown.
///
/// `total` is the connection's message counter at the moment of shutdown.
/// The socket is closed with code 1001 (going away) after this frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByeFrame {
    pub bye: bool,
    pub total: u64,
    pub message: String,
}

impl ByeFrame {
    pub fn new(total: u64) -> Self {
        ByeFrame {
            bye: true,
            total,
            message: BYE_MESSAGE.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// Body of every non-2xx JSON response: `{success: false, error: {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}
