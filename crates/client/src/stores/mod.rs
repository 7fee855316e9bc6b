//! The message store: the single source of truth for conversations.
//!
//! State lives in a [`SyncSnapshot`] held by a `tokio::sync::watch` channel.
//! Every mutation is a closure over the previous snapshot, run under the
//! channel's write lock, so readers only ever see whole snapshots. The
//! conversation map and each conversation are behind `Arc`s and copied on
//! write, which keeps snapshots cheap to hand out.
//!
//! Mutation closures must not call back into the store.

pub mod messages;
pub mod ui;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chatsync_shared::Message;
use tokio::sync::watch;

use crate::session::Viewer;

pub use messages::Conversation;
pub use ui::UiState;

/// Immutable view of everything the UI renders.
#[derive(Clone, Debug, Default)]
pub struct SyncSnapshot {
    pub conversations: Arc<HashMap<String, Arc<Conversation>>>,
    pub current_user: Option<Viewer>,
    pub loading: bool,
    pub ui: UiState,
}

impl SyncSnapshot {
    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id).map(Arc::as_ref)
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.conversations.keys().cloned().collect()
    }

    pub fn total_unread_count(&self) -> u32 {
        self.conversations
            .values()
            .map(|c| c.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    /// Copy-on-write access to one conversation.
    pub fn conversation_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        if !self.conversations.contains_key(conversation_id) {
            return None;
        }
        Arc::make_mut(&mut self.conversations)
            .get_mut(conversation_id)
            .map(Arc::make_mut)
    }

    /// Add a conversation unless one with the same id exists.
    pub fn insert_conversation(&mut self, conversation: Conversation) -> bool {
        if self.conversations.contains_key(&conversation.id) {
            return false;
        }
        Arc::make_mut(&mut self.conversations)
            .insert(conversation.id.clone(), Arc::new(conversation));
        true
    }

    pub fn remove_conversation(&mut self, conversation_id: &str) -> bool {
        if !self.conversations.contains_key(conversation_id) {
            return false;
        }
        Arc::make_mut(&mut self.conversations).remove(conversation_id);
        self.ui.close(conversation_id);
        true
    }
}

/// Outcome of a store mutation; `changed` decides whether watchers wake up.
pub trait Changed {
    fn changed(&self) -> bool;
}

impl Changed for bool {
    fn changed(&self) -> bool {
        *self
    }
}

impl<T> Changed for Option<T> {
    fn changed(&self) -> bool {
        self.is_some()
    }
}

/// Shared handle to the snapshot channel.
#[derive(Clone)]
pub struct MessageStore {
    tx: Arc<watch::Sender<SyncSnapshot>>,
}

impl MessageStore {
    pub fn new(viewer: Viewer) -> Self {
        let snapshot = SyncSnapshot {
            current_user: Some(viewer),
            ..SyncSnapshot::default()
        };
        let (tx, _rx) = watch::channel(snapshot);
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot. Cheap: only `Arc`s are cloned.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver notified after every effective mutation.
    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.tx.subscribe()
    }

    /// Apply `f` to the previous snapshot. Watchers are notified only when
    /// the returned outcome reports a change.
    pub fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut SyncSnapshot) -> R,
        R: Changed,
    {
        let mut outcome = None;
        self.tx.send_if_modified(|snapshot| {
            let result = f(snapshot);
            let changed = result.changed();
            outcome = Some(result);
            changed
        });
        match outcome {
            Some(result) => result,
            None => unreachable!("send_if_modified runs its closure exactly once"),
        }
    }

    /// Apply `f` to one conversation; `None` if the conversation is unknown.
    pub fn update_conversation<R, F>(&self, conversation_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Conversation) -> R,
        R: Changed,
    {
        let mut outcome = None;
        self.tx.send_if_modified(|snapshot| {
            let Some(conv) = snapshot.conversation_mut(conversation_id) else {
                return false;
            };
            let result = f(conv);
            let changed = result.changed();
            outcome = Some(result);
            changed
        });
        outcome
    }

    pub fn insert_conversation(&self, conversation: Conversation) -> bool {
        self.update(|s| s.insert_conversation(conversation))
    }

    pub fn remove_conversation(&self, conversation_id: &str) -> bool {
        self.update(|s| s.remove_conversation(conversation_id))
    }

    pub fn upsert_message(&self, conversation_id: &str, message: Message) -> bool {
        self.update_conversation(conversation_id, |c| c.upsert_message(message))
            .unwrap_or(false)
    }

    pub fn replace_message(&self, conversation_id: &str, old_id: &str, message: Message) -> bool {
        self.update_conversation(conversation_id, |c| c.replace_message(old_id, message))
            .unwrap_or(false)
    }

    pub fn remove_message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.update_conversation(conversation_id, |c| c.remove_message(message_id))
            .flatten()
    }

    pub fn set_unread_count(&self, conversation_id: &str, count: u32) -> bool {
        self.update_conversation(conversation_id, |c| {
            let changed = c.unread_count != count;
            c.unread_count = count;
            changed
        })
        .unwrap_or(false)
    }

    /// Set or clear the typing flag. `None` clears it.
    pub fn set_typing(&self, conversation_id: &str, user_id: Option<&str>) -> bool {
        self.update_conversation(conversation_id, |c| {
            let typing_user = user_id.map(str::to_string);
            let changed = c.typing_user != typing_user;
            c.is_typing = typing_user.is_some();
            c.typing_user = typing_user;
            changed
        })
        .unwrap_or(false)
    }

    pub fn set_history(&self, conversation_id: &str, history: Vec<Message>) -> bool {
        self.update_conversation(conversation_id, |c| {
            c.set_history(history);
            true
        })
        .unwrap_or(false)
    }

    pub fn set_watermark(&self, conversation_id: &str, user_id: &str, at: DateTime<Utc>) -> bool {
        self.update_conversation(conversation_id, |c| c.set_watermark(user_id, at))
            .unwrap_or(false)
    }

    pub fn set_loading(&self, loading: bool) -> bool {
        self.update(|s| {
            let changed = s.loading != loading;
            s.loading = loading;
            changed
        })
    }

    pub fn update_ui<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut UiState) -> bool,
    {
        self.update(|s| f(&mut s.ui))
    }
}
