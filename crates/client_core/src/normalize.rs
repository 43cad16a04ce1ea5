//! Tolerant mapping from arbitrary server payloads onto the canonical
//! [`Message`], [`Chat`] and [`User`] shapes. Every function here is total:
//! missing or mistyped fields fall back to defaults instead of failing.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{
        Chat, ChatId, ChatKind, Message, MessageId, MessageKind, MessageStatus, User, UserId,
    },
    protocol::{string_field, RawChat, RawMessage, RawTimestamp, RawUser, WireFrame},
};
use tracing::debug;

const UNKNOWN_CHAT_NAME: &str = "Unknown Chat";
const MESSAGE_TAGS: [&str; 3] = ["NEW_MESSAGE", "MESSAGE", "CHAT_MESSAGE"];

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(Message),
    Delivered {
        chat_id: ChatId,
        message_id: MessageId,
    },
    ReadReceipt {
        chat_id: ChatId,
        message_id: MessageId,
    },
    UserStatus {
        user_id: UserId,
        is_online: bool,
    },
    Typing {
        chat_id: ChatId,
        user_id: Option<UserId>,
    },
    Authenticated {
        user_id: Option<UserId>,
        username: Option<String>,
    },
    ServerError {
        message: String,
    },
    Ignored,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn normalize_message(raw: &RawMessage) -> Message {
    Message {
        id: raw
            .id
            .clone()
            .map(MessageId::from)
            .unwrap_or_else(MessageId::temporary),
        chat_id: ChatId::from(raw.chat_id.clone().unwrap_or_default()),
        sender_id: UserId::from(raw.sender_id.clone().unwrap_or_default()),
        text: raw.text.clone().unwrap_or_default(),
        timestamp: raw
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or_else(now_millis),
        status: raw
            .status
            .as_deref()
            .and_then(MessageStatus::parse)
            .unwrap_or(MessageStatus::Sent),
        kind: raw
            .kind
            .as_deref()
            .and_then(MessageKind::parse)
            .unwrap_or(MessageKind::Text),
        client_message_id: raw.client_message_id.clone(),
    }
}

/// `None` for an explicit JSON null; the caller must guard.
pub fn normalize_message_value(value: &Value) -> Option<Message> {
    RawMessage::from_value(value).map(|raw| normalize_message(&raw))
}

pub fn normalize_user(raw: &RawUser) -> User {
    let username = raw.username.clone().unwrap_or_default();
    User {
        id: UserId::from(raw.id.clone().unwrap_or_default()),
        name: raw.name.clone().unwrap_or_else(|| username.clone()),
        username,
        avatar_url: raw.avatar_url.clone(),
        is_online: raw.is_online.unwrap_or(false),
        last_seen: raw.last_seen.clone(),
    }
}

pub fn normalize_user_value(value: &Value) -> Option<User> {
    RawUser::from_value(value).map(|raw| normalize_user(&raw))
}

pub fn normalize_chat(raw: &RawChat) -> Chat {
    Chat {
        id: ChatId::from(raw.id.clone().unwrap_or_default()),
        kind: raw
            .kind
            .as_deref()
            .and_then(ChatKind::parse)
            .unwrap_or(ChatKind::Private),
        name: raw
            .name
            .clone()
            .unwrap_or_else(|| UNKNOWN_CHAT_NAME.to_string()),
        avatar_url: raw.avatar_url.clone(),
        participants: raw
            .participants
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(normalize_user)
            .collect(),
        last_message: raw.last_message.as_ref().map(normalize_message),
        unread_count: raw
            .unread_count
            .map(|count| count.clamp(0, i64::from(u32::MAX)) as u32)
            .unwrap_or(0),
    }
}

pub fn normalize_chat_value(value: &Value) -> Option<Chat> {
    RawChat::from_value(value).map(|raw| normalize_chat(&raw))
}

/// Normalizes every element of a JSON array; anything else yields an empty list.
pub fn normalize_list<T>(value: Option<&Value>, normalize: impl Fn(&Value) -> Option<T>) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(normalize).collect())
        .unwrap_or_default()
}

fn parse_timestamp(raw: &RawTimestamp) -> Option<i64> {
    match raw {
        RawTimestamp::Millis(millis) => Some(*millis),
        RawTimestamp::Text(text) => {
            let text = text.trim();
            if let Ok(millis) = text.parse::<i64>() {
                return Some(millis);
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.timestamp_millis());
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| naive.and_utc().timestamp_millis())
        }
    }
}

/// Parses a text frame; non-JSON input is logged and ignored.
pub fn parse_frame(text: &str) -> InboundEvent {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => classify_frame(value),
        Err(err) => {
            debug!(%err, "dropping non-JSON frame");
            InboundEvent::Ignored
        }
    }
}

pub fn classify_frame(value: Value) -> InboundEvent {
    let Some(frame) = WireFrame::from_value(value) else {
        return InboundEvent::Ignored;
    };
    let kind = frame.kind();
    let Some(body) = frame.body().as_object() else {
        return InboundEvent::Ignored;
    };

    match kind.as_deref() {
        Some(tag) if MESSAGE_TAGS.contains(&tag) => normalize_message_value(frame.body())
            .map(InboundEvent::Message)
            .unwrap_or(InboundEvent::Ignored),
        Some("MESSAGE_DELIVERED") | Some("READ_RECEIPT") => {
            let chat_id = string_field(body, &["chatId", "chat_id"]);
            let message_id = string_field(body, &["messageId", "message_id", "id"]);
            match (chat_id, message_id) {
                (Some(chat_id), Some(message_id)) if kind.as_deref() == Some("READ_RECEIPT") => {
                    InboundEvent::ReadReceipt {
                        chat_id: chat_id.into(),
                        message_id: message_id.into(),
                    }
                }
                (Some(chat_id), Some(message_id)) => InboundEvent::Delivered {
                    chat_id: chat_id.into(),
                    message_id: message_id.into(),
                },
                _ => InboundEvent::Ignored,
            }
        }
        Some("USER_STATUS") => {
            let Some(user) = normalize_user_value(frame.body()).filter(|u| !u.id.is_empty())
            else {
                return InboundEvent::Ignored;
            };
            InboundEvent::UserStatus {
                user_id: user.id,
                is_online: user.is_online,
            }
        }
        Some("TYPING") => match string_field(body, &["chatId", "chat_id"]) {
            Some(chat_id) => InboundEvent::Typing {
                chat_id: chat_id.into(),
                user_id: string_field(body, &["userId", "user_id", "senderId"]).map(UserId::from),
            },
            None => InboundEvent::Ignored,
        },
        Some("AUTH_SUCCESS") | Some("CONNECTION_SUCCESS") => InboundEvent::Authenticated {
            user_id: string_field(body, &["userId", "user_id"]).map(UserId::from),
            username: string_field(body, &["username"]),
        },
        Some("ERROR") => InboundEvent::ServerError {
            message: string_field(body, &["message", "error"])
                .unwrap_or_else(|| "Unknown server error".to_string()),
        },
        Some("PONG") | Some("SYSTEM") | Some("AUTH_REQUIRED") => InboundEvent::Ignored,
        _ if string_field(body, &["chatId", "chat_id"]).is_some() => {
            normalize_message_value(frame.body())
                .map(InboundEvent::Message)
                .unwrap_or(InboundEvent::Ignored)
        }
        _ => InboundEvent::Ignored,
    }
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
