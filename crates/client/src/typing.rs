//! Typing indicators, outbound and inbound.
//!
//! Outbound: the first keystroke publishes typing-start and arms an idle
//! timer; further keystrokes only re-arm it. Expiry or an explicit stop
//! publishes typing-stop. Inbound: a remote start sets the conversation's
//! typing flag, which clears itself when no refresh arrives in time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chatsync_shared::{conversation_channel, TypingPayload, TYPING_EVENT};
use tokio::task::JoinHandle;

use crate::stores::MessageStore;
use crate::transport::Transport;

struct Timer {
    generation: u64,
    task: JoinHandle<()>,
}

type TimerMap = Mutex<HashMap<String, Timer>>;

fn lock(map: &TimerMap) -> MutexGuard<'_, HashMap<String, Timer>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct TypingInner {
    viewer_id: String,
    transport: Arc<dyn Transport>,
    store: MessageStore,
    idle: Duration,
    remote_timeout: Duration,
    local: TimerMap,
    remote: TimerMap,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct TypingSignaler {
    inner: Arc<TypingInner>,
}

impl TypingSignaler {
    pub fn new(
        viewer_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: MessageStore,
        idle: Duration,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                viewer_id: viewer_id.into(),
                transport,
                store,
                idle,
                remote_timeout,
                local: Mutex::new(HashMap::new()),
                remote: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether an idle timer is armed for the viewer in `conversation_id`.
    pub fn is_typing(&self, conversation_id: &str) -> bool {
        lock(&self.inner.local).contains_key(conversation_id)
    }

    /// Report a keystroke (`true`) or an explicit stop (`false`).
    pub async fn send_typing(&self, conversation_id: &str, is_typing: bool) {
        if !is_typing {
            let removed = lock(&self.inner.local).remove(conversation_id);
            if let Some(timer) = removed {
                timer.task.abort();
                self.publish(conversation_id, false).await;
            }
            return;
        }

        let generation = self.next_generation();
        let task = tokio::spawn(self.clone().idle_timer(conversation_id.to_string(), generation));
        let previous = lock(&self.inner.local)
            .insert(conversation_id.to_string(), Timer { generation, task });

        match previous {
            Some(timer) => timer.task.abort(),
            None => self.publish(conversation_id, true).await,
        }
    }

    async fn idle_timer(self, conversation_id: String, generation: u64) {
        tokio::time::sleep(self.inner.idle).await;
        let expired = {
            let mut local = lock(&self.inner.local);
            match local.get(&conversation_id) {
                Some(timer) if timer.generation == generation => {
                    local.remove(&conversation_id);
                    true
                }
                _ => false,
            }
        };
        if expired {
            self.publish(&conversation_id, false).await;
        }
    }

    async fn publish(&self, conversation_id: &str, is_typing: bool) {
        let payload = TypingPayload {
            user_id: self.inner.viewer_id.clone(),
            is_typing,
            conversation_id: conversation_id.to_string(),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                crate::log_error!("Failed to encode typing payload: {}", e);
                return;
            }
        };
        let channel = conversation_channel(conversation_id);
        if let Err(e) = self
            .inner
            .transport
            .publish(&channel, TYPING_EVENT, payload)
            .await
        {
            crate::log_warn!("Failed to publish typing to {}: {}", channel, e);
        }
    }

    /// Apply a typing event received from the feed.
    pub fn on_remote(&self, event: &TypingPayload) {
        if event.user_id == self.inner.viewer_id {
            return;
        }
        let conversation_id = event.conversation_id.as_str();

        if !event.is_typing {
            let still_typing = self
                .inner
                .store
                .snapshot()
                .conversation(conversation_id)
                .is_some_and(|c| c.typing_user.as_deref() == Some(event.user_id.as_str()));
            if still_typing {
                if let Some(timer) = lock(&self.inner.remote).remove(conversation_id) {
                    timer.task.abort();
                }
                self.inner.store.set_typing(conversation_id, None);
            }
            return;
        }

        if !self.inner.store.snapshot().contains(conversation_id) {
            crate::log_debug!("Typing for unknown conversation {}", conversation_id);
            return;
        }
        self.inner
            .store
            .set_typing(conversation_id, Some(&event.user_id));

        let generation = self.next_generation();
        let task = tokio::spawn(
            self.clone()
                .remote_timer(conversation_id.to_string(), generation),
        );
        if let Some(previous) = lock(&self.inner.remote)
            .insert(conversation_id.to_string(), Timer { generation, task })
        {
            previous.task.abort();
        }
    }

    async fn remote_timer(self, conversation_id: String, generation: u64) {
        tokio::time::sleep(self.inner.remote_timeout).await;
        let expired = {
            let mut remote = lock(&self.inner.remote);
            match remote.get(&conversation_id) {
                Some(timer) if timer.generation == generation => {
                    remote.remove(&conversation_id);
                    true
                }
                _ => false,
            }
        };
        if expired {
            self.inner.store.set_typing(&conversation_id, None);
        }
    }

    /// Cancel every timer of one conversation without publishing.
    pub fn clear(&self, conversation_id: &str) {
        for map in [&self.inner.local, &self.inner.remote] {
            if let Some(timer) = lock(map).remove(conversation_id) {
                timer.task.abort();
            }
        }
    }

    /// Cancel every timer.
    pub fn clear_all(&self) {
        for map in [&self.inner.local, &self.inner.remote] {
            for (_, timer) in lock(map).drain() {
                timer.task.abort();
            }
        }
    }
}
