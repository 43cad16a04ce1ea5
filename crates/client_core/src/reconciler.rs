//! In-memory chat state: the ordered message list per chat plus the chat
//! summaries, merged from optimistic local writes and server events.

use std::collections::{HashMap, HashSet};

use shared::domain::{
    Chat, ChatId, ChatKind, Message, MessageId, MessageKind, MessageStatus, UserId,
};
use tracing::debug;

use crate::normalize::now_millis;

/// What [`StateReconciler::apply_inbound_message`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Appended and the chat summary updated.
    Applied,
    /// Appended, but the chat is not known locally; the chat list needs a refresh.
    UnknownChat,
    /// An entry with the same id already exists; nothing changed.
    Duplicate,
    /// No chat id; dropped.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct StateReconciler {
    local_user: UserId,
    chats: Vec<Chat>,
    messages_by_chat: HashMap<ChatId, Vec<Message>>,
    active_chat: Option<ChatId>,
}

impl StateReconciler {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            chats: Vec::new(),
            messages_by_chat: HashMap::new(),
            active_chat: None,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.iter().find(|chat| &chat.id == chat_id)
    }

    pub fn messages(&self, chat_id: &ChatId) -> &[Message] {
        self.messages_by_chat
            .get(chat_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn active_chat(&self) -> Option<&ChatId> {
        self.active_chat.as_ref()
    }

    /// Installs a freshly fetched chat list. Chats without a local message
    /// list are seeded with their last message only; history stays lazy.
    pub fn replace_chats(&mut self, chats: Vec<Chat>) {
        self.chats = chats.into_iter().filter(|chat| !chat.id.is_empty()).collect();
        for chat in &mut self.chats {
            if self.active_chat.as_ref() == Some(&chat.id) {
                chat.unread_count = 0;
            }
            self.messages_by_chat
                .entry(chat.id.clone())
                .or_insert_with(|| chat.last_message.iter().cloned().collect());
        }
    }

    /// Appends a PENDING entry with a temporary id. Chat summaries are left
    /// alone until the server echoes the message back.
    ///
    /// At most one unconfirmed entry exists per chat, sender and text: a repeat
    /// send returns the entry already waiting for its echo.
    pub fn apply_optimistic_send(
        &mut self,
        chat_id: &ChatId,
        sender_id: &UserId,
        text: &str,
    ) -> Message {
        let entries = self.messages_by_chat.entry(chat_id.clone()).or_default();
        if let Some(existing) = entries
            .iter()
            .find(|m| m.is_optimistic() && m.sender_id == *sender_id && m.text == text)
        {
            debug!(message_id = %existing.id, "reusing pending entry for repeated send");
            return existing.clone();
        }

        let message = Message {
            id: MessageId::temporary(),
            chat_id: chat_id.clone(),
            sender_id: sender_id.clone(),
            text: text.to_string(),
            timestamp: now_millis(),
            status: MessageStatus::Pending,
            kind: MessageKind::Text,
            client_message_id: None,
        };
        entries.push(message.clone());
        message
    }

    pub fn apply_inbound_message(&mut self, message: Message) -> InboundOutcome {
        if message.chat_id.is_empty() {
            debug!(message_id = %message.id, "dropping inbound message without chat id");
            return InboundOutcome::Rejected;
        }

        let entries = self
            .messages_by_chat
            .entry(message.chat_id.clone())
            .or_default();

        let confirmed = match message.client_message_id.as_deref() {
            Some(correlation) => entries
                .iter()
                .position(|m| m.is_optimistic() && m.id.as_str() == correlation),
            None => entries.iter().position(|m| {
                m.is_optimistic() && m.text == message.text && m.sender_id == message.sender_id
            }),
        };

        let duplicate = entries
            .iter()
            .enumerate()
            .any(|(idx, m)| Some(idx) != confirmed && m.id == message.id);
        if duplicate {
            debug!(message_id = %message.id, chat_id = %message.chat_id, "ignoring re-delivered message");
            return InboundOutcome::Duplicate;
        }

        if let Some(idx) = confirmed {
            let optimistic = entries.remove(idx);
            debug!(temp_id = %optimistic.id, message_id = %message.id, "confirmed optimistic message");
        }
        entries.push(message.clone());

        let is_active = self.active_chat.as_ref() == Some(&message.chat_id);
        let is_mine = message.sender_id == self.local_user;
        let Some(chat) = self.chats.iter_mut().find(|c| c.id == message.chat_id) else {
            return InboundOutcome::UnknownChat;
        };
        if is_active {
            chat.unread_count = 0;
        } else if !is_mine {
            chat.unread_count = chat.unread_count.saturating_add(1);
        }
        chat.last_message = Some(message);
        InboundOutcome::Applied
    }

    /// Focuses a chat and clears its unread counter.
    pub fn select_chat(&mut self, chat_id: &ChatId) {
        self.active_chat = Some(chat_id.clone());
        if let Some(chat) = self.chats.iter_mut().find(|c| &c.id == chat_id) {
            chat.unread_count = 0;
        }
    }

    pub fn clear_active_chat(&mut self) {
        self.active_chat = None;
    }

    /// Merges fetched history into the chat's list. History comes first;
    /// after it, local entries it does not already contain are kept in their
    /// current order: optimistic entries nothing in the history confirms, and
    /// live messages at least as new as the newest history entry.
    pub fn merge_history(&mut self, chat_id: &ChatId, history: Vec<Message>) {
        let existing = self.messages_by_chat.remove(chat_id).unwrap_or_default();
        let history_ids: HashSet<MessageId> = history.iter().map(|m| m.id.clone()).collect();
        let newest = history.iter().map(|m| m.timestamp).max();
        let mut claimed = HashSet::new();
        let mut retained = Vec::new();

        for entry in existing {
            if history_ids.contains(&entry.id) {
                continue;
            }
            if entry.is_optimistic() {
                let confirmation = history.iter().enumerate().find_map(|(idx, h)| {
                    let confirms = match h.client_message_id.as_deref() {
                        Some(correlation) => correlation == entry.id.as_str(),
                        None => {
                            h.sender_id == entry.sender_id
                                && h.text == entry.text
                                && h.timestamp >= entry.timestamp
                        }
                    };
                    (confirms && !claimed.contains(&idx)).then_some(idx)
                });
                match confirmation {
                    Some(idx) => {
                        claimed.insert(idx);
                    }
                    None => retained.push(entry),
                }
            } else if newest.map_or(true, |newest| entry.timestamp >= newest) {
                retained.push(entry);
            }
        }

        let mut merged = history;
        merged.extend(retained);
        self.messages_by_chat.insert(chat_id.clone(), merged);
    }

    /// Raises a message's status. Receipts never move a status backwards.
    pub fn apply_status(
        &mut self,
        chat_id: &ChatId,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> bool {
        let mut changed = false;
        if let Some(entry) = self
            .messages_by_chat
            .get_mut(chat_id)
            .and_then(|entries| entries.iter_mut().find(|m| &m.id == message_id))
        {
            if entry.status < status {
                entry.status = status;
                changed = true;
            }
        }
        if let Some(last) = self
            .chats
            .iter_mut()
            .find(|c| &c.id == chat_id)
            .and_then(|c| c.last_message.as_mut())
            .filter(|m| &m.id == message_id)
        {
            if last.status < status {
                last.status = status;
                changed = true;
            }
        }
        changed
    }

    pub fn set_user_online(&mut self, user_id: &UserId, is_online: bool) -> bool {
        let mut changed = false;
        for user in self
            .chats
            .iter_mut()
            .flat_map(|chat| chat.participants.iter_mut())
            .filter(|user| &user.id == user_id)
        {
            if user.is_online != is_online {
                user.is_online = is_online;
                changed = true;
            }
        }
        changed
    }

    /// Private chat whose participants include `user_id`.
    pub fn find_private_chat_with(&self, user_id: &UserId) -> Option<&Chat> {
        self.chats.iter().find(|chat| {
            chat.kind == ChatKind::Private && chat.has_participant(user_id)
        })
    }

    pub fn clear(&mut self) {
        self.chats.clear();
        self.messages_by_chat.clear();
        self.active_chat = None;
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
