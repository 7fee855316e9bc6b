//! The sync engine: public entry point tying the components together.
//!
//! Inbound frames from every channel funnel into one dispatcher task, which
//! parses them into [`FeedEvent`]s and applies them to the store. Actions
//! (send, read, open/close, typing) are methods on [`SyncEngine`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use chatsync_shared::{
    Attachment, ConversationSummary, FeedEvent, Message, MessageRow, NewMessageRow, SyncError,
};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::eviction::{EvictionManager, EvictionPolicy};
use crate::reconcile::{self, InsertOutcome, WatermarkOutcome};
use crate::session::Viewer;
use crate::stores::{Conversation, MessageStore, SyncSnapshot};
use crate::subscriptions::{ChannelKey, SubscriptionManager, SubscriptionState};
use crate::transport::{FrameStream, HistoryStore, InboundFrame, Transport};
use crate::typing::TypingSignaler;

struct EngineInner {
    config: SyncConfig,
    viewer: Viewer,
    store: MessageStore,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryStore>,
    subscriptions: SubscriptionManager,
    typing: TypingSignaler,
    eviction: EvictionManager,
    /// Taken by the dispatcher on start.
    frames: Mutex<Option<FrameStream>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Conversations whose history fetch is in flight.
    history_loads: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps one viewer's conversations in sync with the feed.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        viewer: Viewer,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let (sink, frames) = mpsc::unbounded_channel();
        let store = MessageStore::new(viewer.clone());
        let subscriptions = SubscriptionManager::new(
            viewer.user_id.clone(),
            transport.clone(),
            sink,
            config.conversation_retry.clone(),
            config.global_retry.clone(),
        );
        let typing = TypingSignaler::new(
            viewer.user_id.clone(),
            transport.clone(),
            store.clone(),
            config.typing_idle,
            config.remote_typing_timeout,
        );
        let eviction = EvictionManager::new(
            store.clone(),
            typing.clone(),
            subscriptions.clone(),
            EvictionPolicy {
                max_conversations: config.max_conversations,
                max_age: config.max_conversation_age,
            },
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                viewer,
                store,
                transport,
                history,
                subscriptions,
                typing,
                eviction,
                frames: Mutex::new(Some(frames)),
                tasks: Mutex::new(Vec::new()),
                history_loads: Mutex::new(HashSet::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.inner.viewer
    }

    /// Subscribe the global channel, load the viewer's conversations and
    /// their history, subscribe each one, and start the eviction ticker.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.ensure_running()?;
        let Some(frames) = lock(&self.inner.frames).take() else {
            crate::log_warn!("Sync engine already started");
            return Ok(());
        };

        crate::log_info!("Starting sync for {}", self.inner.viewer.user_id);
        self.inner.store.set_loading(true);
        self.spawn_task(tokio::spawn(self.clone().dispatch(frames)));
        self.inner.subscriptions.start();

        let summaries = match self
            .inner
            .history
            .list_conversations(&self.inner.viewer.user_id)
            .await
        {
            Ok(summaries) => summaries,
            Err(e) => {
                crate::log_error!("Failed to list conversations: {}", e);
                self.inner.store.set_loading(false);
                return Err(e.into());
            }
        };

        let ids: Vec<String> = summaries.iter().map(|s| s.id.clone()).collect();
        for summary in summaries {
            self.add_conversation(summary);
        }
        for result in join_all(ids.iter().map(|id| self.load_conversation(id))).await {
            if let Err(e) = result {
                crate::log_warn!("History load failed: {}", e);
            }
        }
        self.inner
            .subscriptions
            .sync_with(&self.inner.store.snapshot().conversation_ids())
            .await;
        self.inner.store.set_loading(false);

        let ticker = self
            .inner
            .eviction
            .clone()
            .spawn(self.inner.config.eviction_interval);
        self.spawn_task(ticker);
        crate::log_info!("Loaded {} conversations", ids.len());
        Ok(())
    }

    /// Tear down every subscription, timer and background task.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.typing.clear_all();
        self.inner.subscriptions.stop().await;
        crate::log_info!("Stopped sync for {}", self.inner.viewer.user_id);
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(SyncError::NotRunning);
        }
        Ok(())
    }

    fn ensure_known(&self, conversation_id: &str) -> Result<(), SyncError> {
        if self.inner.store.snapshot().contains(conversation_id) {
            Ok(())
        } else {
            Err(SyncError::UnknownConversation(conversation_id.to_string()))
        }
    }

    fn spawn_task(&self, task: JoinHandle<()>) {
        lock(&self.inner.tasks).push(task);
    }

    fn add_conversation(&self, summary: ConversationSummary) -> bool {
        let mut conversation = Conversation::from_summary(summary, Utc::now());
        if !conversation.participants.contains_key(&self.inner.viewer.user_id) {
            let me = self.inner.viewer.as_participant();
            conversation.participants.insert(me.id.clone(), me);
        }
        self.inner.store.insert_conversation(conversation)
    }

    // --- Reads ---

    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.store.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.store.watch()
    }

    pub fn total_unread_count(&self) -> u32 {
        self.inner.store.snapshot().total_unread_count()
    }

    pub fn subscription_state(&self, key: &ChannelKey) -> Option<SubscriptionState> {
        self.inner.subscriptions.state(key)
    }

    // --- Actions ---

    /// Show `text` immediately as a pending message, then persist it.
    ///
    /// On failure the pending message is removed and the error returned;
    /// nothing is retried.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SyncError> {
        self.ensure_running()?;
        self.ensure_known(conversation_id)?;

        let media_url = attachments.first().map(|a| a.url.clone());
        let optimistic = Message::optimistic(
            self.inner.viewer.user_id.clone(),
            text,
            attachments,
            Utc::now(),
        );
        let temp_id = optimistic.id.clone();
        let client_key = optimistic.client_key.clone().unwrap_or_default();
        self.inner.store.upsert_message(conversation_id, optimistic);

        self.inner.typing.send_typing(conversation_id, false).await;

        let row = NewMessageRow {
            conversation_id: conversation_id.to_string(),
            sender_id: self.inner.viewer.user_id.clone(),
            content: text.to_string(),
            client_key,
            media_url,
        };
        match self.inner.transport.insert_message(row).await {
            Ok(stored) => {
                let message = stored.into_message();
                self.apply_insert(conversation_id, message.clone());
                Ok(message)
            }
            Err(e) => {
                crate::log_warn!("Send to {} failed: {}", conversation_id, e);
                self.inner.store.remove_message(conversation_id, &temp_id);
                Err(SyncError::SendFailed(e))
            }
        }
    }

    /// Zero unread and persist the viewer's watermark. Does nothing when the
    /// conversation is already read.
    pub async fn mark_conversation_as_read(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.ensure_known(conversation_id)?;

        let Some(at) = self
            .inner
            .store
            .update(|s| reconcile::mark_read(s, conversation_id))
        else {
            return Ok(());
        };
        self.inner
            .transport
            .update_last_read(conversation_id, &self.inner.viewer.user_id, at)
            .await?;
        crate::log_debug!("Marked {} read up to {}", conversation_id, at);
        Ok(())
    }

    /// Open a window: make it active, load history, (re)subscribe, mark read.
    ///
    /// A failed history fetch does not stop the rest; its error is returned
    /// once the window is subscribed and read.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.ensure_known(conversation_id)?;

        self.inner.store.update_ui(|ui| ui.open(conversation_id));
        let history = self.load_conversation(conversation_id).await;
        if let Err(e) = &history {
            crate::log_warn!("History load for {} failed: {}", conversation_id, e);
        }
        self.inner
            .subscriptions
            .resubscribe(ChannelKey::conversation(conversation_id));
        self.mark_conversation_as_read(conversation_id).await?;
        history
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> bool {
        self.inner.typing.send_typing(conversation_id, false).await;
        self.inner.store.update_ui(|ui| ui.close(conversation_id))
    }

    pub fn minimize_conversation(&self, conversation_id: &str) -> bool {
        self.inner.store.update_ui(|ui| ui.minimize(conversation_id))
    }

    pub async fn send_typing_indicator(
        &self,
        conversation_id: &str,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.ensure_known(conversation_id)?;
        self.inner.typing.send_typing(conversation_id, is_typing).await;
        Ok(())
    }

    /// Fetch stored messages once per conversation and merge them with any
    /// received live.
    pub async fn load_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        let already_loaded = self
            .inner
            .store
            .snapshot()
            .conversation(conversation_id)
            .map(|c| c.is_loaded)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?;
        if already_loaded {
            return Ok(());
        }
        let claimed = lock(&self.inner.history_loads).insert(conversation_id.to_string());
        if !claimed {
            return Ok(());
        }

        let result = self.inner.history.load_messages(conversation_id).await;
        lock(&self.inner.history_loads).remove(conversation_id);
        let history = result?;

        let viewer = self.inner.viewer.user_id.clone();
        let count = history.len();
        self.inner.store.update(|s| {
            let is_active = s.ui.is_active(conversation_id);
            let Some(conv) = s.conversation_mut(conversation_id) else {
                return false;
            };
            conv.set_history(history);
            conv.unread_count = if is_active {
                0
            } else {
                conv.count_unread(&viewer, conv.watermark(&viewer))
            };
            true
        });
        crate::log_debug!("Loaded {} messages for {}", count, conversation_id);
        Ok(())
    }

    // --- Inbound ---

    async fn dispatch(self, mut frames: FrameStream) {
        while let Some(frame) = frames.recv().await {
            match frame {
                InboundFrame::Status { channel, status } => {
                    self.inner.subscriptions.handle_status(&channel, status);
                }
                InboundFrame::Event { channel, text } => match FeedEvent::from_frame(&text) {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => crate::log_warn!("Dropping frame on {}: {}", channel, e),
                },
            }
        }
        crate::log_debug!("Frame stream closed");
    }

    async fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::MessageInsert(row) => self.on_insert(row),
            FeedEvent::MessageUpdate(row) => {
                let conversation_id = row.conversation_id.clone();
                let update = row.into_message();
                self.inner
                    .store
                    .update(|s| reconcile::apply_update(s, &conversation_id, &update));
            }
            FeedEvent::Typing(payload) => self.inner.typing.on_remote(&payload),
            FeedEvent::ParticipantChanged(change) => {
                let outcome = self.inner.store.update(|s| {
                    reconcile::apply_watermark(
                        s,
                        &change.conversation_id,
                        &change.user_id,
                        change.last_read_at,
                    )
                });
                if let WatermarkOutcome::Receipt { delivered } = outcome {
                    if delivered > 0 {
                        crate::log_debug!(
                            "{} read {} messages in {}",
                            change.user_id,
                            delivered,
                            change.conversation_id
                        );
                    }
                }
            }
            FeedEvent::ConversationJoined(summary) => self.on_joined(summary),
            FeedEvent::ConversationLeft(left) => {
                let id = left.conversation_id;
                if self.inner.store.remove_conversation(&id) {
                    crate::log_info!("Left conversation {}", id);
                }
                self.inner.typing.clear(&id);
                self.inner
                    .subscriptions
                    .unsubscribe(&ChannelKey::conversation(id))
                    .await;
            }
        }
    }

    fn apply_insert(&self, conversation_id: &str, message: Message) -> InsertOutcome {
        let window = chrono::Duration::from_std(self.inner.config.optimistic_match_window)
            .unwrap_or(chrono::Duration::MAX);
        let outcome = self
            .inner
            .store
            .update(|s| reconcile::apply_insert(s, conversation_id, message, window));
        match &outcome {
            InsertOutcome::UnknownConversation => {
                crate::log_debug!("Insert for unknown conversation {}", conversation_id);
            }
            InsertOutcome::Reconciled { temp_id } => {
                crate::log_debug!("Reconciled {} in {}", temp_id, conversation_id);
            }
            InsertOutcome::Duplicate | InsertOutcome::Inserted { .. } => {}
        }
        outcome
    }

    /// Messages landing in the active window raise no unread; advancing
    /// the watermark stays with the caller.
    fn on_insert(&self, row: MessageRow) {
        let conversation_id = row.conversation_id.clone();
        self.apply_insert(&conversation_id, row.into_message());
    }

    fn on_joined(&self, summary: ConversationSummary) {
        let id = summary.id.clone();
        if !self.add_conversation(summary) {
            return;
        }
        crate::log_info!("Joined conversation {}", id);
        self.inner
            .subscriptions
            .subscribe(ChannelKey::conversation(id.clone()));

        let engine = self.clone();
        self.spawn_task(tokio::spawn(async move {
            if let Err(e) = engine.load_conversation(&id).await {
                crate::log_warn!("History load for {} failed: {}", id, e);
            }
        }));
    }
}
