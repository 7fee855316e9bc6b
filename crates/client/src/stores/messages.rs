//! Per-conversation message state.
//!
//! A [`Conversation`] keeps its messages sorted by `created_at` ascending.
//! Messages are unique by id; a temporary message is replaced in place when
//! its authoritative counterpart arrives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chatsync_shared::{ConversationSummary, Message, MessageStatus, Participant};

#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: String,
    /// All known messages, sorted by created_at ascending.
    pub messages: Vec<Message>,
    pub participants: BTreeMap<String, Participant>,
    pub unread_count: u32,
    pub is_typing: bool,
    /// Who triggered `is_typing`, if anyone.
    pub typing_user: Option<String>,
    /// Whether the history has been fetched from the history store.
    pub is_loaded: bool,
    /// When the conversation became known locally.
    pub loaded_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, participants: Vec<Participant>, loaded_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            participants: participants.into_iter().map(|p| (p.id.clone(), p)).collect(),
            unread_count: 0,
            is_typing: false,
            typing_user: None,
            is_loaded: false,
            loaded_at,
        }
    }

    pub fn from_summary(summary: ConversationSummary, loaded_at: DateTime<Utc>) -> Self {
        Self::new(summary.id, summary.participants, loaded_at)
    }

    /// Most recent message by timestamp.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.iter().max_by_key(|m| m.created_at)
    }

    /// Time of the latest message, or when the conversation was loaded.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message()
            .map(|m| m.created_at)
            .unwrap_or(self.loaded_at)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Add a message, keeping timestamp order.
    /// Returns false if a message with the same ID already exists.
    pub fn add_message(&mut self, msg: Message) -> bool {
        if self.contains(&msg.id) {
            return false;
        }

        // Insert after any message with an equal timestamp so arrival order
        // breaks ties.
        let pos = self
            .messages
            .partition_point(|m| m.created_at <= msg.created_at);

        self.messages.insert(pos, msg);
        true
    }

    /// Replace the message at `old_id`'s index. Returns false if absent.
    pub fn replace_message(&mut self, old_id: &str, msg: Message) -> bool {
        match self.position(old_id) {
            Some(idx) => {
                self.messages[idx] = msg;
                true
            }
            None => false,
        }
    }

    /// Insert a message or overwrite the one with the same id in place.
    pub fn upsert_message(&mut self, msg: Message) -> bool {
        match self.position(&msg.id) {
            Some(idx) if self.messages[idx] == msg => false,
            Some(idx) => {
                self.messages[idx] = msg;
                true
            }
            None => self.add_message(msg),
        }
    }

    pub fn remove_message(&mut self, message_id: &str) -> Option<Message> {
        let idx = self.position(message_id)?;
        Some(self.messages.remove(idx))
    }

    /// Set the history fetched from storage.
    ///
    /// Messages that arrived live before the fetch completed are kept.
    pub fn set_history(&mut self, history: Vec<Message>) {
        let live = std::mem::take(&mut self.messages);
        let mut merged = history;
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.messages = merged;
        for msg in live {
            self.add_message(msg);
        }
        self.is_loaded = true;
    }

    pub fn watermark(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.participants.get(user_id).and_then(|p| p.last_read_at)
    }

    /// Set a participant's watermark, creating the participant if needed.
    /// Returns true when the stored value changed.
    pub fn set_watermark(&mut self, user_id: &str, at: DateTime<Utc>) -> bool {
        let participant = self
            .participants
            .entry(user_id.to_string())
            .or_insert_with(|| Participant::new(user_id));
        if participant.last_read_at == Some(at) {
            return false;
        }
        participant.last_read_at = Some(at);
        true
    }

    /// Messages from anyone but `viewer_id` newer than `watermark`.
    pub fn count_unread(&self, viewer_id: &str, watermark: Option<DateTime<Utc>>) -> u32 {
        let count = self
            .messages
            .iter()
            .filter(|m| m.sender_id != viewer_id)
            .filter(|m| watermark.map_or(true, |w| m.created_at > w))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Promote the viewer's `sent` messages at or before `read_at` to `delivered`.
    /// Returns the number of messages changed.
    pub fn mark_delivered_until(&mut self, viewer_id: &str, read_at: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for msg in self
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == viewer_id && m.created_at <= read_at)
        {
            if msg.status == MessageStatus::Sent {
                msg.status = MessageStatus::Delivered;
                changed += 1;
            }
        }
        changed
    }
}
