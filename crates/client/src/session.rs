//! Identity of the local viewer.

use serde::{Deserialize, Serialize};

use chatsync_shared::Participant;

/// The signed-in user the engine syncs on behalf of.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Viewer {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl Viewer {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    /// Participant entry for the viewer, used when a conversation lacks one.
    pub fn as_participant(&self) -> Participant {
        let participant = Participant::new(self.user_id.clone());
        match &self.display_name {
            Some(name) => participant.with_display_name(name.clone()),
            None => participant,
        }
    }
}
