/// Shared types for the conversation engine and its wire formats
use crate::switchboard::SwitchState;
use crate::transport::SessionState;
use chrono::{DateTime, NaiveDateTime};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// One chat message. Identity is the server-assigned `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Monotonic per conversation, not gap-free
    #[serde(alias = "id")]
    pub message_id: i64,
    pub content: String,
    #[serde(deserialize_with = "string_or_number")]
    pub written_by: String,
    /// Epoch milliseconds
    #[serde(alias = "createdAt", deserialize_with = "epoch_millis")]
    pub timestamp: i64,
}

/// Entry of `GET /chat/conversations`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub match_id: i64,
    pub other_user_name: String,
    #[serde(default)]
    pub last_message_content: Option<String>,
    #[serde(default, deserialize_with = "optional_epoch_millis")]
    pub last_message_timestamp: Option<i64>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

/// Body published to a conversation's send destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub content: String,
    pub written_by: String,
    pub match_id: i64,
}

/// Response of `POST /login`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub username: String,
    pub id: i64,
}

/// Real-time events for the UI layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The streaming session changed state
    Session { state: SessionState },
    /// The switchboard changed state
    Conversation { state: SwitchState },
    /// A message was appended to the active timeline
    MessageAppended { conversation_id: i64, message: Message },
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

impl RawTimestamp {
    fn into_millis(self) -> std::result::Result<i64, String> {
        match self {
            RawTimestamp::Millis(ms) => Ok(ms),
            RawTimestamp::Text(text) => parse_timestamp(&text),
        }
    }
}

/// Accepts RFC 3339, or a zone-less ISO datetime interpreted as UTC.
fn parse_timestamp(text: &str) -> std::result::Result<i64, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp_millis())
        .map_err(|e| format!("invalid timestamp {:?}: {}", text, e))
}

fn epoch_millis<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    RawTimestamp::deserialize(deserializer)?
        .into_millis()
        .map_err(de::Error::custom)
}

fn optional_epoch_millis<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawTimestamp>::deserialize(deserializer)? {
        Some(raw) => raw.into_millis().map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_frame_body_decodes() {
        let body = r#"{"messageId":7,"content":"hej","writtenBy":"12","timestamp":1700000000000}"#;
        let msg: Message = serde_json::from_str(body).unwrap();
        assert_eq!(msg.message_id, 7);
        assert_eq!(msg.written_by, "12");
        assert_eq!(msg.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_history_shape_with_iso_timestamp() {
        let body = r#"{"id":3,"content":"cześć","writtenBy":5,"createdAt":"2024-05-01T12:00:00.250"}"#;
        let msg: Message = serde_json::from_str(body).unwrap();
        assert_eq!(msg.message_id, 3);
        assert_eq!(msg.written_by, "5");
        assert_eq!(msg.timestamp, 1_714_564_800_250);
    }

    #[test]
    fn test_outbound_uses_camel_case() {
        let out = OutboundMessage {
            content: "hi".to_string(),
            written_by: "4".to_string(),
            match_id: 42,
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"content": "hi", "writtenBy": "4", "matchId": 42})
        );
    }

    #[test]
    fn test_conversation_without_messages() {
        let body = r#"{"matchId":9,"otherUserName":"Ola","lastMessageContent":null,"lastMessageTimestamp":null,"photoUrl":"/p/9.jpg"}"#;
        let conv: ConversationSummary = serde_json::from_str(body).unwrap();
        assert_eq!(conv.match_id, 9);
        assert_eq!(conv.last_message_content, None);
        assert_eq!(conv.last_message_timestamp, None);
    }

    #[test]
    fn test_bad_timestamp_is_rejected() {
        let body = r#"{"messageId":1,"content":"x","writtenBy":"1","timestamp":"yesterday"}"#;
        assert!(serde_json::from_str::<Message>(body).is_err());
    }
}
