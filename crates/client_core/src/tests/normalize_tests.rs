use super::*;
use serde_json::json;

#[test]
fn snake_case_and_camel_case_messages_normalize_equally() {
    let legacy = normalize_message_value(&json!({
        "content": "hi",
        "created_at": "2024-01-01T00:00:00Z",
        "chat_id": "c1",
        "sender_id": "u1"
    }))
    .expect("legacy message");
    let canonical = normalize_message_value(&json!({
        "text": "hi",
        "timestamp": 1_704_067_200_000i64,
        "chatId": "c1",
        "senderId": "u1"
    }))
    .expect("canonical message");

    assert_eq!(legacy.text, canonical.text);
    assert_eq!(legacy.chat_id, canonical.chat_id);
    assert_eq!(legacy.sender_id, canonical.sender_id);
    assert_eq!(legacy.timestamp, canonical.timestamp);
    assert_eq!(legacy.timestamp, 1_704_067_200_000);
}

#[test]
fn missing_fields_take_defaults() {
    let before = now_millis();
    let message = normalize_message_value(&json!({})).expect("message");
    assert!(message.id.is_temporary());
    assert_eq!(message.text, "");
    assert!(message.timestamp >= before);
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.kind, MessageKind::Text);
    assert!(message.chat_id.is_empty());
}

#[test]
fn explicit_null_yields_none() {
    assert_eq!(normalize_message_value(&Value::Null), None);
}

#[test]
fn status_and_kind_are_case_insensitive() {
    let message = normalize_message_value(&json!({
        "status": "delivered",
        "type": "IMAGE"
    }))
    .expect("message");
    assert_eq!(message.status, MessageStatus::Delivered);
    assert_eq!(message.kind, MessageKind::Image);
}

#[test]
fn unknown_status_falls_back_to_sent() {
    let message = normalize_message_value(&json!({ "status": "queued", "type": "NEW_MESSAGE" }))
        .expect("message");
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.kind, MessageKind::Text);
}

#[test]
fn naive_iso_timestamps_are_read_as_utc() {
    let message = normalize_message_value(&json!({ "created_at": "2024-01-01T00:00:00.500" }))
        .expect("message");
    assert_eq!(message.timestamp, 1_704_067_200_500);
}

#[test]
fn numeric_ids_are_stringified() {
    let message = normalize_message_value(&json!({ "id": 17, "chatId": 3, "sender_id": 9 }))
        .expect("message");
    assert_eq!(message.id.as_str(), "17");
    assert_eq!(message.chat_id.as_str(), "3");
    assert_eq!(message.sender_id.as_str(), "9");
}

#[test]
fn chat_defaults_apply() {
    let chat = normalize_chat_value(&json!({ "id": "c1", "type": "channel" })).expect("chat");
    assert_eq!(chat.kind, ChatKind::Private);
    assert_eq!(chat.name, "Unknown Chat");
    assert!(chat.participants.is_empty());
    assert_eq!(chat.last_message, None);
    assert_eq!(chat.unread_count, 0);
}

#[test]
fn chat_embeds_normalized_last_message_and_clamps_unread() {
    let chat = normalize_chat_value(&json!({
        "id": "c1",
        "type": "GROUP",
        "name": "Team",
        "avatar_url": "http://a/b.png",
        "participants": [{ "id": "u1", "username": "ann", "is_online": true }],
        "lastMessage": { "id": "m1", "content": "yo", "chat_id": "c1" },
        "unreadCount": -4
    }))
    .expect("chat");
    assert_eq!(chat.kind, ChatKind::Group);
    assert_eq!(chat.avatar_url.as_deref(), Some("http://a/b.png"));
    assert_eq!(chat.participants[0].name, "ann");
    assert!(chat.participants[0].is_online);
    assert_eq!(
        chat.last_message.as_ref().map(|m| m.text.as_str()),
        Some("yo")
    );
    assert_eq!(chat.unread_count, 0);
}

#[test]
fn recognized_message_tags_are_case_insensitive() {
    let event = classify_frame(json!({
        "type": "new_message",
        "payload": { "id": "m1", "chatId": "c1", "senderId": "A", "text": "hello" }
    }));
    let InboundEvent::Message(message) = event else {
        panic!("expected message event, got {event:?}");
    };
    assert_eq!(message.id.as_str(), "m1");
    assert_eq!(message.text, "hello");
}

#[test]
fn untyped_frame_with_chat_id_is_a_message() {
    let event = classify_frame(json!({ "chatId": "c1", "senderId": "u2", "text": "yo" }));
    assert!(matches!(event, InboundEvent::Message(ref m) if m.chat_id.as_str() == "c1"));

    let event = classify_frame(json!({ "type": "WHATEVER", "chat_id": "c9" }));
    assert!(matches!(event, InboundEvent::Message(ref m) if m.chat_id.as_str() == "c9"));
}

#[test]
fn untyped_frame_without_chat_id_is_ignored() {
    assert_eq!(classify_frame(json!({ "hello": "world" })), InboundEvent::Ignored);
    assert_eq!(classify_frame(json!([1, 2, 3])), InboundEvent::Ignored);
    assert_eq!(parse_frame("not json"), InboundEvent::Ignored);
}

#[test]
fn delivery_and_read_receipts_are_classified() {
    assert_eq!(
        classify_frame(json!({
            "type": "MESSAGE_DELIVERED",
            "payload": { "messageId": "m1", "chatId": "c1" }
        })),
        InboundEvent::Delivered {
            chat_id: ChatId::from("c1"),
            message_id: MessageId::from("m1"),
        }
    );
    assert_eq!(
        classify_frame(json!({
            "type": "READ_RECEIPT",
            "payload": { "messageId": "m1", "chatId": "c1" }
        })),
        InboundEvent::ReadReceipt {
            chat_id: ChatId::from("c1"),
            message_id: MessageId::from("m1"),
        }
    );
}

#[test]
fn presence_typing_auth_and_errors_are_classified() {
    assert_eq!(
        classify_frame(json!({
            "type": "USER_STATUS",
            "payload": { "userId": "u1", "username": "ann", "isOnline": true }
        })),
        InboundEvent::UserStatus {
            user_id: UserId::from("u1"),
            is_online: true,
        }
    );
    assert_eq!(
        classify_frame(json!({ "type": "TYPING", "payload": { "chatId": "c1", "userId": "u1" } })),
        InboundEvent::Typing {
            chat_id: ChatId::from("c1"),
            user_id: Some(UserId::from("u1")),
        }
    );
    assert_eq!(
        classify_frame(json!({ "type": "AUTH_SUCCESS", "userId": "u1", "username": "ann" })),
        InboundEvent::Authenticated {
            user_id: Some(UserId::from("u1")),
            username: Some("ann".to_string()),
        }
    );
    assert_eq!(
        classify_frame(json!({ "type": "ERROR", "payload": { "message": "Not authenticated" } })),
        InboundEvent::ServerError {
            message: "Not authenticated".to_string(),
        }
    );
    assert_eq!(classify_frame(json!({ "type": "PONG" })), InboundEvent::Ignored);
}
