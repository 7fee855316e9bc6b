#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chatsync_client::{LoopbackFeed, SyncConfig, SyncEngine, Viewer};
use chatsync_shared::{
    conversation_channel, ConversationSummary, FeedEvent, MessageRow, Participant,
};
use chrono::{DateTime, Utc};

pub fn summary(id: &str, users: &[&str]) -> ConversationSummary {
    ConversationSummary {
        id: id.to_string(),
        participants: users.iter().map(|u| Participant::new(*u)).collect(),
    }
}

pub fn engine(feed: &LoopbackFeed, user_id: &str) -> SyncEngine {
    engine_with(feed, user_id, SyncConfig::default())
}

pub fn engine_with(feed: &LoopbackFeed, user_id: &str, config: SyncConfig) -> SyncEngine {
    let conn = Arc::new(feed.connect());
    SyncEngine::new(config, Viewer::new(user_id), conn.clone(), conn)
}

pub fn row(conversation_id: &str, id: &str, sender: &str, at: DateTime<Utc>) -> MessageRow {
    MessageRow {
        conversation_id: conversation_id.to_string(),
        id: id.to_string(),
        sender_id: sender.to_string(),
        content: format!("message {id}"),
        created_at: at,
        media_url: None,
        client_key: None,
        status: None,
    }
}

/// Broadcast an insert on the conversation channel, as another client would.
pub fn deliver(feed: &LoopbackFeed, row: MessageRow) {
    let channel = conversation_channel(&row.conversation_id);
    feed.emit(&channel, &FeedEvent::MessageInsert(row));
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
