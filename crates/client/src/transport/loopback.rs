//! In-process pub-sub feed.
//!
//! Every channel is a `tokio::sync::broadcast` sender; each subscription is a
//! forwarding task that pushes frames into the subscriber's sink. Rows and
//! conversations live in memory, so the feed doubles as a [`HistoryStore`].
//! Failure knobs let tests script channel errors and rejected inserts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chatsync_shared::{
    conversation_channel, global_channel, ChannelSpec, ChannelStatus, ConversationSummary,
    FeedEvent, Message, MessageRow, MessageStatus, NewMessageRow,
    ParticipantChange, TransportError,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{FrameSink, HistoryStore, InboundFrame, Transport};

const CHANNEL_CAPACITY: usize = 100;

/// Scripted subscribe failure for channels starting with a prefix.
struct SubscribeFailure {
    prefix: String,
    /// `None` fails forever.
    remaining: Option<usize>,
    status: ChannelStatus,
}

struct Subscription {
    sink: FrameSink,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct FeedState {
    channels: HashMap<String, broadcast::Sender<String>>,
    /// (connection id, channel name) → live subscription
    subscriptions: HashMap<(u64, String), Subscription>,
    subscribe_calls: HashMap<String, usize>,
    conversations: HashMap<String, ConversationSummary>,
    rows: HashMap<String, Vec<MessageRow>>,
    published: Vec<(String, String, serde_json::Value)>,
    subscribe_failures: Vec<SubscribeFailure>,
    insert_failures: usize,
    history_failures: usize,
    subscribe_latency: Duration,
}

impl FeedState {
    fn channel(&mut self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn broadcast(&mut self, channel: &str, frame: String) {
        // No receivers is fine: nobody is listening on that channel yet.
        let _ = self.channel(channel).send(frame);
    }

    fn emit(&mut self, channel: &str, event: &FeedEvent) {
        match event.to_frame() {
            Ok(frame) => self.broadcast(channel, frame),
            Err(e) => crate::log_error!("Failed to encode feed event: {}", e),
        }
    }

    fn scripted_failure(&mut self, channel: &str) -> Option<ChannelStatus> {
        let idx = self
            .subscribe_failures
            .iter()
            .position(|f| channel.starts_with(&f.prefix) && f.remaining != Some(0))?;
        let failure = &mut self.subscribe_failures[idx];
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(failure.status)
    }
}

/// Shared in-memory feed. Clone freely; clones share state.
#[derive(Clone, Default)]
pub struct LoopbackFeed {
    state: Arc<Mutex<FeedState>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Open a client connection to the feed.
    pub fn connect(&self) -> LoopbackTransport {
        LoopbackTransport {
            feed: self.clone(),
            connection_id: self.next_id(),
        }
    }

    /// Register a conversation and announce it on each participant's global
    /// channel.
    pub fn add_conversation(&self, summary: ConversationSummary) {
        let mut state = self.state();
        state.rows.entry(summary.id.clone()).or_default();
        for participant in &summary.participants {
            state.emit(
                &global_channel(&participant.id),
                &FeedEvent::ConversationJoined(summary.clone()),
            );
        }
        state.conversations.insert(summary.id.clone(), summary);
    }

    /// Store a row without broadcasting it, as if it predates the session.
    pub fn seed_row(&self, row: MessageRow) {
        self.state()
            .rows
            .entry(row.conversation_id.clone())
            .or_default()
            .push(row);
    }

    /// Broadcast an event on a channel as the server would.
    pub fn emit(&self, channel: &str, event: &FeedEvent) {
        self.state().emit(channel, event);
    }

    /// Broadcast an arbitrary frame, valid or not.
    pub fn emit_raw(&self, channel: &str, frame: impl Into<String>) {
        self.state().broadcast(channel, frame.into());
    }

    /// Fail subscribes to channels starting with `prefix`, `times` times
    /// (`None` = forever), reporting `status`.
    pub fn fail_subscribes(&self, prefix: &str, times: Option<usize>, status: ChannelStatus) {
        self.state().subscribe_failures.push(SubscribeFailure {
            prefix: prefix.to_string(),
            remaining: times,
            status,
        });
    }

    /// Reject the next `times` message inserts.
    pub fn fail_inserts(&self, times: usize) {
        self.state().insert_failures += times;
    }

    /// Delay every subscribe acknowledgement by `latency`.
    pub fn delay_subscribes(&self, latency: Duration) {
        self.state().subscribe_latency = latency;
    }

    /// Time out the next `times` history fetches.
    pub fn fail_history_loads(&self, times: usize) {
        self.state().history_failures += times;
    }

    /// Drop every subscription to `channel`, reporting `status` to each
    /// subscriber.
    pub fn break_channel(&self, channel: &str, status: ChannelStatus) {
        let mut state = self.state();
        let keys: Vec<(u64, String)> = state
            .subscriptions
            .keys()
            .filter(|(_, name)| name == channel)
            .cloned()
            .collect();
        for key in keys {
            if let Some(sub) = state.subscriptions.remove(&key) {
                sub.forwarder.abort();
                let _ = sub.sink.send(InboundFrame::Status {
                    channel: channel.to_string(),
                    status,
                });
            }
        }
    }

    pub fn subscribe_calls(&self, channel: &str) -> usize {
        self.state().subscribe_calls.get(channel).copied().unwrap_or(0)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state()
            .subscriptions
            .keys()
            .filter(|(_, name)| name == channel)
            .count()
    }

    /// Every `(channel, event, payload)` published so far.
    pub fn published(&self) -> Vec<(String, String, serde_json::Value)> {
        self.state().published.clone()
    }

    pub fn rows(&self, conversation_id: &str) -> Vec<MessageRow> {
        self.state()
            .rows
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn watermark(&self, conversation_id: &str, user_id: &str) -> Option<DateTime<Utc>> {
        self.state()
            .conversations
            .get(conversation_id)?
            .participants
            .iter()
            .find(|p| p.id == user_id)?
            .last_read_at
    }
}

/// One client connection to a [`LoopbackFeed`].
#[derive(Clone)]
pub struct LoopbackTransport {
    feed: LoopbackFeed,
    connection_id: u64,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(
        &self,
        spec: &ChannelSpec,
        sink: FrameSink,
    ) -> Result<ChannelStatus, TransportError> {
        let latency = {
            let mut state = self.feed.state();
            *state.subscribe_calls.entry(spec.name.clone()).or_default() += 1;

            if let Some(status) = state.scripted_failure(&spec.name) {
                return Ok(status);
            }

            let mut rx = state.channel(&spec.name).subscribe();
            let channel = spec.name.clone();
            let forward_sink = sink.clone();
            let forwarder = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(text) => {
                            let frame = InboundFrame::Event {
                                channel: channel.clone(),
                                text,
                            };
                            if forward_sink.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            crate::log_warn!("Subscriber on {} lagged by {} frames", channel, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            if let Some(old) = state.subscriptions.insert(
                (self.connection_id, spec.name.clone()),
                Subscription { sink, forwarder },
            ) {
                old.forwarder.abort();
            }
            state.subscribe_latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(ChannelStatus::Subscribed)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let removed = self
            .feed
            .state()
            .subscriptions
            .remove(&(self.connection_id, channel.to_string()));
        if let Some(sub) = removed {
            sub.forwarder.abort();
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let frame = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": event,
            "data": payload.clone(),
            "ts": Utc::now(),
        });
        let mut state = self.feed.state();
        state
            .published
            .push((channel.to_string(), event.to_string(), payload));
        state.broadcast(channel, frame.to_string());
        Ok(())
    }

    async fn insert_message(&self, row: NewMessageRow) -> Result<MessageRow, TransportError> {
        let id = self.feed.next_id();
        let mut state = self.feed.state();
        if state.insert_failures > 0 {
            state.insert_failures -= 1;
            return Err(TransportError::Rejected {
                status: 503,
                body: "insert rejected".to_string(),
            });
        }
        if !state.conversations.contains_key(&row.conversation_id) {
            return Err(TransportError::Rejected {
                status: 404,
                body: format!("no conversation {}", row.conversation_id),
            });
        }

        let stored = MessageRow {
            conversation_id: row.conversation_id,
            id: format!("msg-{id}"),
            sender_id: row.sender_id,
            content: row.content,
            created_at: Utc::now(),
            media_url: row.media_url,
            client_key: Some(row.client_key),
            status: Some(MessageStatus::Sent),
        };
        state
            .rows
            .entry(stored.conversation_id.clone())
            .or_default()
            .push(stored.clone());
        state.emit(
            &conversation_channel(&stored.conversation_id),
            &FeedEvent::MessageInsert(stored.clone()),
        );
        Ok(stored)
    }

    async fn update_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        let mut state = self.feed.state();
        let Some(summary) = state.conversations.get_mut(conversation_id) else {
            return Err(TransportError::Rejected {
                status: 404,
                body: format!("no conversation {conversation_id}"),
            });
        };
        if let Some(participant) = summary.participants.iter_mut().find(|p| p.id == user_id) {
            participant.last_read_at = Some(at);
        }
        state.emit(
            &conversation_channel(conversation_id),
            &FeedEvent::ParticipantChanged(ParticipantChange {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
                last_read_at: at,
            }),
        );
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for LoopbackTransport {
    async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, TransportError> {
        let state = self.feed.state();
        let mut summaries: Vec<ConversationSummary> = state
            .conversations
            .values()
            .filter(|c| c.participants.iter().any(|p| p.id == user_id))
            .cloned()
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError> {
        {
            let mut state = self.feed.state();
            if state.history_failures > 0 {
                state.history_failures -= 1;
                return Err(TransportError::Timeout);
            }
        }
        Ok(self
            .feed
            .rows(conversation_id)
            .into_iter()
            .map(MessageRow::into_message)
            .collect())
    }
}
