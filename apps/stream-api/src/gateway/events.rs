//! Gateway opcodes, event names, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_REQUEST: u8 = 4;
pub const OP_ACK: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0) — a room broadcast or notice.
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            n: None,
            d: data,
        }
    }

    /// Build an ACK message (op=5) answering the client request with the
    /// given nonce. One ack per request, always addressed to the caller only.
    pub fn ack(nonce: u64, data: Value) -> Self {
        Self {
            op: OP_ACK,
            t: None,
            s: None,
            n: Some(nonce),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            n: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub n: Option<u64>,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Request payloads (client → core, camelCase wire shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateRoomPayload {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomPayload {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessagePayload {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessagePayload {
    #[serde(rename = "messageId")]
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutUserPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default = "default_timeout_secs")]
    pub duration: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct SendReactionPayload {
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStreamInfoPayload {
    pub title: Option<String>,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatch event names (core → client; stable wire contract)
// ---------------------------------------------------------------------------

pub struct EventName;

impl EventName {
    pub const READY: &'static str = "ready";
    pub const NEW_MESSAGE: &'static str = "new-message";
    pub const MESSAGE_DELETED: &'static str = "message-deleted";
    pub const CHAT_CLEARED: &'static str = "chat-cleared";
    pub const VIEWER_JOINED: &'static str = "viewer-joined";
    pub const VIEWER_LEFT: &'static str = "viewer-left";
    pub const NEW_VIEWER: &'static str = "new-viewer";
    pub const STREAM_ENDED: &'static str = "stream-ended";
    pub const NEW_STREAM_STARTED: &'static str = "new-stream-started";
    pub const USER_TIMED_OUT: &'static str = "user-timed-out";
    pub const REACTION: &'static str = "reaction";
    pub const STREAM_INFO_UPDATED: &'static str = "stream-info-updated";
}

// ---------------------------------------------------------------------------
// Request event names (client → core)
// ---------------------------------------------------------------------------

pub struct RequestName;

impl RequestName {
    pub const CREATE_ROOM: &'static str = "create-room";
    pub const JOIN_ROOM: &'static str = "join-room";
    pub const LEAVE_ROOM: &'static str = "leave-room";
    pub const CHAT_MESSAGE: &'static str = "chat-message";
    pub const DELETE_MESSAGE: &'static str = "delete-message";
    pub const CLEAR_CHAT: &'static str = "clear-chat";
    pub const TIMEOUT_USER: &'static str = "timeout-user";
    pub const SEND_REACTION: &'static str = "send-reaction";
    pub const GET_VIEWERS: &'static str = "get-viewers";
    pub const UPDATE_STREAM_INFO: &'static str = "update-stream-info";
}
