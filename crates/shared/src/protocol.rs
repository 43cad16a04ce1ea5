//! Wire-level shapes: outbound frames, the REST envelope, and the raw
//! inbound shapes that collect every known alias before normalization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ChatId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Flat auth frame, sent once right after the transport opens.
    Auth { token: String },
    Message { payload: OutboundMessage },
    Typing { payload: TypingPayload },
}

impl ClientFrame {
    pub fn auth(token: impl Into<String>) -> Self {
        Self::Auth {
            token: token.into(),
        }
    }

    pub fn message(
        chat_id: ChatId,
        text: impl Into<String>,
        timestamp: i64,
        client_message_id: Option<MessageId>,
    ) -> Self {
        Self::Message {
            payload: OutboundMessage {
                chat_id,
                text: text.into(),
                timestamp,
                client_message_id,
            },
        }
    }

    pub fn typing(chat_id: ChatId) -> Self {
        Self::Typing {
            payload: TypingPayload { chat_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: ChatId,
}

/// `{ success, message?, data? }` wrapper returned by every REST endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ApiEnvelope {
    /// Looks up `data.<key>`, falling back to `data` itself.
    pub fn data_field_or_data(&self, key: &str) -> Option<&Value> {
        let data = self.data.as_ref()?;
        match data.get(key) {
            Some(value) if !value.is_null() => Some(value),
            _ => Some(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrivateChatRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub participant_ids: Vec<UserId>,
}

impl CreatePrivateChatRequest {
    pub fn with(user_id: UserId) -> Self {
        Self {
            kind: "PRIVATE".to_string(),
            participant_ids: vec![user_id],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub full_name: String,
    pub username: String,
    pub password: String,
}

/// A decoded inbound frame: either `{type, payload: {...}}` or a flat object.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Enveloped { kind: Option<String>, payload: Value },
    Flat { kind: Option<String>, body: Value },
}

impl WireFrame {
    /// Returns `None` for anything that is not a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };
        let kind = string_field(&object, &["type"]);
        match object.remove("payload") {
            Some(payload @ Value::Object(_)) => Some(Self::Enveloped { kind, payload }),
            Some(other) => {
                object.insert("payload".to_string(), other);
                Some(Self::Flat {
                    kind,
                    body: Value::Object(object),
                })
            }
            None => Some(Self::Flat {
                kind,
                body: Value::Object(object),
            }),
        }
    }

    /// Upper-cased type tag, if any.
    pub fn kind(&self) -> Option<String> {
        match self {
            Self::Enveloped { kind, .. } | Self::Flat { kind, .. } => {
                kind.as_deref().map(str::to_ascii_uppercase)
            }
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Self::Enveloped { payload, .. } => payload,
            Self::Flat { body, .. } => body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub id: Option<String>,
    pub chat_id: Option<String>,
    pub sender_id: Option<String>,
    pub text: Option<String>,
    pub timestamp: Option<RawTimestamp>,
    pub status: Option<String>,
    pub kind: Option<String>,
    pub client_message_id: Option<String>,
}

impl RawMessage {
    /// `None` only for an explicit JSON null. A nested `payload` object is unwrapped.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        let data = match value.get("payload") {
            Some(payload @ Value::Object(_)) => payload,
            _ => value,
        };
        let Value::Object(object) = data else {
            return Some(Self::default());
        };

        let sender_id = string_field(object, &["senderId", "sender_id"]).or_else(|| {
            object
                .get("sender")
                .and_then(Value::as_object)
                .and_then(|sender| string_field(sender, &["id"]))
        });

        Some(Self {
            id: string_field(object, &["id", "messageId", "message_id"]),
            chat_id: string_field(object, &["chatId", "chat_id"]),
            sender_id,
            text: string_field(object, &["text", "content", "body"]),
            timestamp: timestamp_field(
                object,
                &["timestamp", "sentAt", "sent_at", "created_at", "createdAt"],
            ),
            status: string_field(object, &["status"]),
            kind: string_field(object, &["type"]),
            client_message_id: string_field(
                object,
                &["clientMessageId", "client_message_id", "correlationId"],
            ),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawUser {
    pub id: Option<String>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub is_online: Option<bool>,
    pub last_seen: Option<String>,
}

impl RawUser {
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        Some(Self {
            id: string_field(object, &["id", "userId", "user_id"]),
            name: string_field(object, &["name", "fullName", "full_name"]),
            username: string_field(object, &["username"]),
            avatar_url: string_field(object, &["avatarUrl", "avatar_url"]),
            is_online: bool_field(object, &["isOnline", "is_online", "online"]),
            last_seen: string_field(object, &["lastSeen", "last_seen"]),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChat {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub participants: Option<Vec<RawUser>>,
    pub last_message: Option<RawMessage>,
    pub unread_count: Option<i64>,
}

impl RawChat {
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let participants = object
            .get("participants")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(RawUser::from_value).collect());
        let last_message = ["lastMessage", "last_message"]
            .iter()
            .filter_map(|key| object.get(*key))
            .find(|value| value.is_object())
            .and_then(RawMessage::from_value);

        Some(Self {
            id: string_field(object, &["id", "chatId", "chat_id"]),
            kind: string_field(object, &["type"]),
            name: string_field(object, &["name"]),
            avatar_url: string_field(object, &["avatarUrl", "avatar_url"]),
            participants,
            last_message,
            unread_count: integer_field(object, &["unreadCount", "unread_count"]),
        })
    }
}

/// First non-empty string (or number rendered as a string) among `keys`.
pub fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn bool_field(object: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn integer_field(object: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn timestamp_field(object: &Map<String, Value>, keys: &[&str]) -> Option<RawTimestamp> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .filter(|millis| *millis != 0)
            .map(RawTimestamp::Millis),
        Value::String(s) if !s.is_empty() => Some(RawTimestamp::Text(s.clone())),
        _ => None,
    })
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
