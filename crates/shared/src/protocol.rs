//! Wire format of the pub-sub feed.
//!
//! Every inbound frame is a JSON envelope with a `type`/`data` tagged payload.
//! Frames are parsed and validated here, at the network boundary, so the
//! engine only ever handles well-formed [`FeedEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Attachment, ConversationSummary, Message, MessageStatus};

/// Event name used when publishing typing broadcasts.
pub const TYPING_EVENT: &str = "typing";

/// Channel carrying row changes and broadcasts for one conversation.
pub fn conversation_channel(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

/// Channel carrying cross-conversation events for one viewer.
pub fn global_channel(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Status reported by the feed for a channel subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, ChannelStatus::Subscribed)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Subscription request: a channel name plus row filters understood by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub filters: Vec<String>,
}

impl ChannelSpec {
    pub fn conversation(conversation_id: &str) -> Self {
        Self {
            name: conversation_channel(conversation_id),
            filters: vec![format!("conversation_id=eq.{conversation_id}")],
        }
    }

    pub fn global(user_id: &str) -> Self {
        Self {
            name: global_channel(user_id),
            filters: vec![format!("user_id=eq.{user_id}")],
        }
    }
}

// --- Rows ---

/// A message row as stored and echoed by the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub conversation_id: String,
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl MessageRow {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.conversation_id.is_empty() {
            return Err(ProtocolError::MissingField("conversationId"));
        }
        if self.id.is_empty() {
            return Err(ProtocolError::MissingField("id"));
        }
        if self.sender_id.is_empty() {
            return Err(ProtocolError::MissingField("senderId"));
        }
        if crate::models::is_temp_id(&self.id) {
            return Err(ProtocolError::TemporaryId(self.id.clone()));
        }
        Ok(())
    }

    /// Convert into the engine's message representation.
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            client_key: self.client_key,
            sender_id: self.sender_id,
            text: self.content,
            created_at: self.created_at,
            status: self.status.unwrap_or(MessageStatus::Sent),
            attachments: self.media_url.map(Attachment::from_url).into_iter().collect(),
            reactions: Vec::new(),
        }
    }
}

/// Row submitted when inserting a new message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageRow {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub client_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: String,
    pub is_typing: bool,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChange {
    pub user_id: String,
    pub conversation_id: String,
    pub last_read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: String,
}

// --- Envelope ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> FeedEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    #[serde(rename = "message.insert")]
    MessageInsert(MessageRow),
    #[serde(rename = "message.update")]
    MessageUpdate(MessageRow),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "participant.changed")]
    ParticipantChanged(ParticipantChange),
    #[serde(rename = "conversation.joined")]
    ConversationJoined(ConversationSummary),
    #[serde(rename = "conversation.left")]
    ConversationLeft(ConversationRef),
}

impl FeedEvent {
    /// Parse and validate a raw JSON frame.
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        let envelope: FeedEnvelope<FeedEvent> = serde_json::from_str(text)?;
        envelope.payload.validate()?;
        Ok(envelope.payload)
    }

    /// Serialize into a frame with a fresh envelope.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&FeedEnvelope::new(self))?)
    }

    /// Conversation the event is addressed to.
    pub fn conversation_id(&self) -> &str {
        match self {
            FeedEvent::MessageInsert(row) | FeedEvent::MessageUpdate(row) => &row.conversation_id,
            FeedEvent::Typing(t) => &t.conversation_id,
            FeedEvent::ParticipantChanged(p) => &p.conversation_id,
            FeedEvent::ConversationJoined(c) => &c.id,
            FeedEvent::ConversationLeft(c) => &c.conversation_id,
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            FeedEvent::MessageInsert(row) | FeedEvent::MessageUpdate(row) => row.validate(),
            FeedEvent::Typing(t) if t.user_id.is_empty() => {
                Err(ProtocolError::MissingField("userId"))
            }
            FeedEvent::ParticipantChanged(p) if p.user_id.is_empty() => {
                Err(ProtocolError::MissingField("userId"))
            }
            _ if self.conversation_id().is_empty() => {
                Err(ProtocolError::MissingField("conversationId"))
            }
            _ => Ok(()),
        }
    }
}
