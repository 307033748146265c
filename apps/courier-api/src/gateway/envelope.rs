//! Wire envelope codec and payload shapes.
//!
//! Every frame is a UTF-8 JSON envelope `{type, payload, request_id?,
//! timestamp}`. Decoding is two-stage: the outer envelope keeps `payload`
//! as a raw `serde_json::Value`, and the handler re-parses it with the
//! schema selected by `type`. Multiple envelopes may share one transport
//! frame, separated by `\n`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// Envelope type names.
pub struct EventName;

impl EventName {
    // Client → server
    pub const SEND_MESSAGE: &'static str = "send_message";
    pub const READ_MESSAGE: &'static str = "read_message";
    pub const READ_CHAT: &'static str = "read_chat";
    pub const TYPING_START: &'static str = "typing_start";
    pub const TYPING_STOP: &'static str = "typing_stop";
    pub const SUBSCRIBE_CHAT: &'static str = "subscribe_chat";
    pub const UNSUBSCRIBE_CHAT: &'static str = "unsubscribe_chat";
    pub const PING: &'static str = "ping";

    // Server → client
    pub const MESSAGE: &'static str = "message";
    pub const MESSAGE_STATUS: &'static str = "message_status";
    pub const MESSAGE_READ: &'static str = "message_read";
    pub const TYPING: &'static str = "typing";
    pub const USER_ONLINE: &'static str = "user_online";
    pub const USER_OFFLINE: &'static str = "user_offline";
    pub const CHAT_UPDATED: &'static str = "chat_updated";
    pub const NEW_CHAT: &'static str = "new_chat";
    pub const ERROR: &'static str = "error";
    pub const AUTH_ERROR: &'static str = "auth_error";
}

/// Machine-readable `error` envelope codes.
pub mod code {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const INVALID_CHAT_ID: &str = "invalid_chat_id";
    pub const INVALID_MESSAGE_ID: &str = "invalid_message_id";
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    pub const NOT_MEMBER: &str = "not_member";
    pub const SUBSCRIBE_FAILED: &str = "subscribe_failed";
    pub const MESSAGE_NOT_FOUND: &str = "message_not_found";
    pub const SEND_FAILED: &str = "send_failed";
    pub const READ_CHAT_FAILED: &str = "read_chat_failed";
}

// ---------------------------------------------------------------------------
// Server → client envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope of the given type, stamped with the server time.
    pub fn event(kind: &'static str, payload: impl Serialize) -> Self {
        Self {
            kind,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Build an `error` envelope.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::event(
            EventName::ERROR,
            ErrorPayload {
                code: code.to_string(),
                message: message.into(),
            },
        )
    }

    /// Echo the client's request id on a direct reply.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Serialize to a wire frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(?e, kind = self.kind, "failed to serialize envelope");
            "{}".to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Client → server envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Split a transport frame into individual envelope documents.
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(str::trim).filter(|l| !l.is_empty())
}

// ---------------------------------------------------------------------------
// Client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub chat_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadMessagePayload {
    pub message_id: String,
}

/// Payload for the intents that only reference a chat: `read_chat`,
/// `typing_start`, `typing_stop`, `subscribe_chat`, `unsubscribe_chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRefPayload {
    pub chat_id: String,
}

// ---------------------------------------------------------------------------
// Server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessagePayload {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub content: String,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MessageStatusPayload {
    pub message_id: Uuid,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MessageReadPayload {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TypingStatusPayload {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Serialize)]
pub struct UserStatusPayload {
    pub user_id: Uuid,
    pub username: String,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ChatUpdatedPayload {
    pub chat_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_spec_fields() {
        let env = Envelope::error(code::UNKNOWN_TYPE, "Unknown message type");
        let value: Value = serde_json::from_str(&env.to_frame()).unwrap();

        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "unknown_type");
        assert_eq!(value["payload"]["message"], "Unknown message type");
        assert!(value["timestamp"].is_string());
        // request_id absent unless the client supplied one.
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn envelope_echoes_request_id() {
        let env = Envelope::error(code::INVALID_JSON, "bad")
            .with_request_id(Some("req-1".to_string()));
        let value: Value = serde_json::from_str(&env.to_frame()).unwrap();
        assert_eq!(value["request_id"], "req-1");
    }

    #[test]
    fn two_stage_decode() {
        let raw = r#"{"type":"send_message","payload":{"chat_id":"c1","content":"hi"},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let outer: ClientEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(outer.kind, "send_message");

        let inner: SendMessagePayload = serde_json::from_value(outer.payload).unwrap();
        assert_eq!(inner.chat_id, "c1");
        assert_eq!(inner.content, "hi");
        assert!(inner.message_type.is_none());
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let outer: ClientEnvelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(outer.kind, "ping");
        assert!(outer.payload.is_null());
    }

    #[test]
    fn split_frames_handles_concatenation() {
        let frames: Vec<&str> =
            split_frames("{\"type\":\"ping\"}\n{\"type\":\"ping\"}\n\n").collect();
        assert_eq!(frames.len(), 2);

        let single: Vec<&str> = split_frames("{\"type\":\"ping\"}").collect();
        assert_eq!(single, vec!["{\"type\":\"ping\"}"]);
    }

    #[test]
    fn message_payload_omits_absent_optionals() {
        let payload = MessagePayload {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender_name: "Alice".to_string(),
            sender_avatar: None,
            content: "hi".to_string(),
            message_type: "text".to_string(),
            media_url: None,
            reply_to_id: None,
            is_edited: false,
            is_deleted: false,
            status: "sent".to_string(),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("sender_avatar").is_none());
        assert!(value.get("media_url").is_none());
        assert!(value.get("reply_to_id").is_none());
        assert_eq!(value["status"], "sent");
    }
}
