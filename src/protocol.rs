//! Wire-compatible message envelope published to chat streams.
//!
//! Every envelope is a UTF-8 JSON object tagged by `type`:
//!
//! ```text
//! { id, type: "message" | "system" | "dm-initiation",
//!   channel, username?, content, timestamp, from?, to?, dmChannel? }
//! ```
//!
//! Ids and timestamps are assigned by the publisher, never by the broker.
//! Timestamps are ISO 8601 strings with millisecond precision in UTC.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Prefix of per-user notification channel names.
pub const NOTIFICATION_CHANNEL_PREFIX: &str = "user-notifications-";

const KIND_MESSAGE: &str = "message";
const KIND_SYSTEM: &str = "system";
const KIND_DM_INITIATION: &str = "dm-initiation";

/// Name of the notification channel that belongs to `username`.
pub fn notification_channel_name(username: &str) -> String {
    format!("{NOTIFICATION_CHANNEL_PREFIX}{username}")
}

/// A message carried on a chat or notification stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatMessage {
    /// A message typed by a user.
    #[serde(rename = "message")]
    Message {
        id: String,
        channel: String,
        /// Author of the message. Anonymous publishers omit it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        content: String,
        timestamp: String,
    },
    /// A lifecycle notice (joins, leaves) generated by a client.
    #[serde(rename = "system")]
    System {
        id: String,
        channel: String,
        content: String,
        timestamp: String,
    },
    /// Invitation to a direct-message channel, delivered to the recipient's
    /// notification channel.
    #[serde(rename = "dm-initiation")]
    DmInitiation {
        id: String,
        /// Notification channel the invitation was published to. Older
        /// publishers omit it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        from: String,
        to: String,
        #[serde(rename = "dmChannel")]
        dm_channel: String,
        timestamp: String,
    },
}

impl ChatMessage {
    /// Build a user message. Surrounding whitespace is trimmed from `content`.
    pub fn user(channel: &str, username: &str, content: &str) -> Self {
        Self::Message {
            id: next_message_id(),
            channel: channel.to_owned(),
            username: Some(username.to_owned()),
            content: content.trim().to_owned(),
            timestamp: now_timestamp(),
        }
    }

    /// Build a system notice for `channel`.
    pub fn system(channel: &str, content: impl Into<String>) -> Self {
        Self::System {
            id: next_message_id(),
            channel: channel.to_owned(),
            content: content.into(),
            timestamp: now_timestamp(),
        }
    }

    /// Build a DM invitation from `from` to `to` for `dm_channel`.
    pub fn dm_initiation(from: &str, to: &str, dm_channel: &str) -> Self {
        Self::DmInitiation {
            id: next_message_id(),
            channel: Some(notification_channel_name(to)),
            from: from.to_owned(),
            to: to.to_owned(),
            dm_channel: dm_channel.to_owned(),
            timestamp: now_timestamp(),
        }
    }

    /// Decode an envelope from a delivery body.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownMessageType`] when the `type` tag is not one
    /// of the known kinds, or [`ChatError::Serialization`] when the body is not
    /// a well-formed envelope.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        match value.get("type").and_then(serde_json::Value::as_str) {
            Some(KIND_MESSAGE | KIND_SYSTEM | KIND_DM_INITIATION) | None => {
                Ok(serde_json::from_value(value)?)
            }
            Some(other) => Err(ChatError::UnknownMessageType(other.to_owned())),
        }
    }

    /// Encode the envelope as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Serialization`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The publisher-assigned message id.
    pub fn id(&self) -> &str {
        match self {
            Self::Message { id, .. } | Self::System { id, .. } | Self::DmInitiation { id, .. } => {
                id
            }
        }
    }

    /// The publisher-assigned timestamp.
    pub fn timestamp(&self) -> &str {
        match self {
            Self::Message { timestamp, .. }
            | Self::System { timestamp, .. }
            | Self::DmInitiation { timestamp, .. } => timestamp,
        }
    }

    /// The channel named in the envelope, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Message { channel, .. } | Self::System { channel, .. } => Some(channel),
            Self::DmInitiation { channel, .. } => channel.as_deref(),
        }
    }

    /// Author of a user message, when the publisher named one.
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Message { username, .. } => username.as_deref(),
            Self::System { .. } | Self::DmInitiation { .. } => None,
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => KIND_MESSAGE,
            Self::System { .. } => KIND_SYSTEM,
            Self::DmInitiation { .. } => KIND_DM_INITIATION,
        }
    }
}

/// Generate a fresh, opaque message id.
pub fn next_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn user_message_trims_content_and_uses_wire_names() {
        let msg = ChatMessage::user("general", "alice", "  hi  ");
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "message");
        assert_eq!(json["channel"], "general");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["content"], "hi");
        assert!(json["id"].as_str().unwrap().starts_with("msg_"));
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn system_message_has_no_username() {
        let msg = ChatMessage::system("general", "alice joined the channel");
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "system");
        assert!(json.get("username").is_none());
        assert_eq!(json["content"], "alice joined the channel");
    }

    #[test]
    fn dm_initiation_uses_camel_case_dm_channel() {
        let msg = ChatMessage::dm_initiation("alice", "bob", "dm-alice-bob");
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "dm-initiation");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["dmChannel"], "dm-alice-bob");
        assert_eq!(json["channel"], "user-notifications-bob");
    }

    #[test]
    fn decodes_dm_initiation_without_channel() {
        let body = br#"{"id":"msg_1","type":"dm-initiation","from":"alice","to":"bob","dmChannel":"dm-alice-bob","timestamp":"2024-01-01T00:00:00.000Z"}"#;
        let msg = ChatMessage::decode(body).unwrap();
        match msg {
            ChatMessage::DmInitiation {
                channel,
                dm_channel,
                ..
            } => {
                assert!(channel.is_none());
                assert_eq!(dm_channel, "dm-alice-bob");
            }
            other => panic!("expected DmInitiation, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let body = br#"{"id":"x","type":"reaction","channel":"general","content":":)","timestamp":"t"}"#;
        let err = ChatMessage::decode(body).unwrap_err();
        assert!(matches!(err, ChatError::UnknownMessageType(ref t) if t == "reaction"));
    }

    #[test]
    fn decode_rejects_missing_type_and_garbage() {
        let err = ChatMessage::decode(br#"{"id":"x","content":"c"}"#).unwrap_err();
        assert!(matches!(err, ChatError::Serialization(_)));

        let err = ChatMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, ChatError::Serialization(_)));
    }

    #[test]
    fn decode_accepts_foreign_user_message() {
        let body = br#"{"id":"msg_1700000000000_abc123def","type":"message","channel":"general","username":"carol","content":"hello","timestamp":"2024-01-01T00:00:00.000Z"}"#;
        let msg = ChatMessage::decode(body).unwrap();
        assert_eq!(msg.id(), "msg_1700000000000_abc123def");
        assert_eq!(msg.channel(), Some("general"));
        assert_eq!(msg.kind(), "message");
        assert_eq!(msg.timestamp(), "2024-01-01T00:00:00.000Z");
        assert_eq!(msg.username(), Some("carol"));
    }

    #[test]
    fn decodes_user_message_without_username() {
        let body = br#"{"id":"m1","type":"message","channel":"general","content":"hi","timestamp":"2024-01-01T00:00:00.000Z"}"#;
        let msg = ChatMessage::decode(body).unwrap();
        assert_eq!(msg.kind(), "message");
        assert_eq!(msg.username(), None);

        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert!(json.get("username").is_none());
    }

    #[test]
    fn message_ids_are_unique() {
        let a = ChatMessage::system("general", "x");
        let b = ChatMessage::system("general", "x");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn notification_channel_name_uses_prefix() {
        assert_eq!(notification_channel_name("bob"), "user-notifications-bob");
    }
}
