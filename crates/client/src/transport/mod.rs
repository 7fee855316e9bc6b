//! Network boundary of the engine.
//!
//! [`Transport`] is the pub-sub provider as seen from one client connection;
//! [`HistoryStore`] is the persistent store queried when a conversation loads.
//! Inbound traffic reaches the engine as [`InboundFrame`]s pushed into the
//! [`FrameSink`] handed over at subscribe time.

pub mod loopback;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chatsync_shared::{
    ChannelSpec, ChannelStatus, ConversationSummary, Message, MessageRow, NewMessageRow,
    TransportError,
};
use tokio::sync::mpsc;

pub use loopback::{LoopbackFeed, LoopbackTransport};

/// Raw traffic delivered by a transport for one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A JSON frame, validated by the engine before use.
    Event { channel: String, text: String },
    /// The channel changed status after subscribing (error, timeout, close).
    Status { channel: String, status: ChannelStatus },
}

pub type FrameSink = mpsc::UnboundedSender<InboundFrame>;
pub type FrameStream = mpsc::UnboundedReceiver<InboundFrame>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to a channel; frames for it are pushed into `sink`.
    /// Resolves with the first status the feed reports.
    async fn subscribe(
        &self,
        spec: &ChannelSpec,
        sink: FrameSink,
    ) -> Result<ChannelStatus, TransportError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Broadcast an ephemeral event to a channel.
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Insert a message row; resolves with the stored row.
    async fn insert_message(&self, row: NewMessageRow) -> Result<MessageRow, TransportError>;

    /// Persist a participant's read watermark.
    async fn update_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Conversations the user participates in.
    async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, TransportError>;

    /// Stored messages of one conversation, in any order.
    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError>;
}
