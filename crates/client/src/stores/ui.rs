//! Window state reported by the UI layer.

use std::collections::BTreeSet;

/// Which conversations the UI is showing. Eviction never drops these.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UiState {
    pub open_windows: BTreeSet<String>,
    pub minimized_windows: BTreeSet<String>,
    pub active_conversation: Option<String>,
}

impl UiState {
    pub fn is_visible(&self, conversation_id: &str) -> bool {
        self.open_windows.contains(conversation_id)
            || self.minimized_windows.contains(conversation_id)
            || self.active_conversation.as_deref() == Some(conversation_id)
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active_conversation.as_deref() == Some(conversation_id)
    }

    /// Open (or restore) a window and make it active.
    pub fn open(&mut self, conversation_id: &str) -> bool {
        let restored = self.minimized_windows.remove(conversation_id);
        let opened = self.open_windows.insert(conversation_id.to_string());
        let activated = !self.is_active(conversation_id);
        self.active_conversation = Some(conversation_id.to_string());
        restored || opened || activated
    }

    pub fn minimize(&mut self, conversation_id: &str) -> bool {
        let closed = self.open_windows.remove(conversation_id);
        let minimized = self.minimized_windows.insert(conversation_id.to_string());
        let deactivated = self.clear_active(conversation_id);
        closed || minimized || deactivated
    }

    /// Forget every trace of a conversation.
    pub fn close(&mut self, conversation_id: &str) -> bool {
        let closed = self.open_windows.remove(conversation_id);
        let restored = self.minimized_windows.remove(conversation_id);
        let deactivated = self.clear_active(conversation_id);
        closed || restored || deactivated
    }

    fn clear_active(&mut self, conversation_id: &str) -> bool {
        if self.is_active(conversation_id) {
            self.active_conversation = None;
            true
        } else {
            false
        }
    }
}
