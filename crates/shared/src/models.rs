//! Conversation data model shared by the engine and the feed transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by every locally generated (optimistic) message id.
/// Server-assigned ids never start with it.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Generate a fresh client key and the matching temporary message id.
pub fn new_temp_id() -> (String, String) {
    let key = Uuid::new_v4().to_string();
    (format!("{TEMP_ID_PREFIX}{key}"), key)
}

/// Whether `id` belongs to the temporary (optimistic) namespace.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

// --- Identity ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    Online,
    Away,
    Dnd,
    #[default]
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub presence: Availability,
    /// Timestamp up to which this participant has read the conversation.
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            avatar: None,
            presence: Availability::Offline,
            last_read_at: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_last_read_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_read_at = Some(at);
        self
    }
}

// --- Objects ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub mime: String,
    pub url: String,
    pub size: u64,
}

impl Attachment {
    /// Attachment built from a bare media url, as carried by feed rows.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            mime: "application/octet-stream".to_string(),
            url,
            size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

// --- Messaging ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Idempotency key generated by the sending client and echoed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Build the optimistic copy of an outgoing message.
    pub fn optimistic(
        sender_id: impl Into<String>,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (id, key) = new_temp_id();
        Self {
            id,
            client_key: Some(key),
            sender_id: sender_id.into(),
            text: text.into(),
            created_at,
            status: MessageStatus::Sending,
            attachments,
            reactions: Vec::new(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        is_temp_id(&self.id)
    }
}

/// A conversation as listed by the history store, before its messages load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub participants: Vec<Participant>,
}
