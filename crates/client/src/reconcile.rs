//! Merging of feed events into store snapshots.
//!
//! Everything here is a pure function over a `&mut SyncSnapshot`, meant to
//! run inside [`MessageStore::update`](crate::stores::MessageStore::update).

use chrono::{DateTime, Duration, Utc};
use chatsync_shared::Message;

use crate::stores::{Changed, Conversation, SyncSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    UnknownConversation,
    /// A message with the same id is already stored.
    Duplicate,
    /// The optimistic message `temp_id` was replaced by the stored one.
    Reconciled { temp_id: String },
    Inserted { unread_incremented: bool },
}

impl Changed for InsertOutcome {
    fn changed(&self) -> bool {
        matches!(
            self,
            InsertOutcome::Reconciled { .. } | InsertOutcome::Inserted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkOutcome {
    /// Unknown conversation, or the watermark did not advance.
    Ignored,
    /// The viewer's watermark moved; unread was recomputed.
    Read { unread_count: u32 },
    /// Another participant's watermark moved.
    Receipt { delivered: usize },
}

impl Changed for WatermarkOutcome {
    fn changed(&self) -> bool {
        !matches!(self, WatermarkOutcome::Ignored)
    }
}

fn viewer_id(snapshot: &SyncSnapshot) -> &str {
    snapshot
        .current_user
        .as_ref()
        .map(|v| v.user_id.as_str())
        .unwrap_or_default()
}

/// Find the optimistic message an authoritative insert stands for.
///
/// The client key wins; without a key match, the closest temporary message
/// from the same sender within `window` is taken, unless both sides carry
/// keys that differ.
fn find_optimistic(conv: &Conversation, incoming: &Message, window: Duration) -> Option<usize> {
    if let Some(key) = incoming.client_key.as_deref() {
        if let Some(idx) = conv
            .messages
            .iter()
            .position(|m| m.is_temporary() && m.client_key.as_deref() == Some(key))
        {
            return Some(idx);
        }
    }

    conv.messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_temporary() && m.sender_id == incoming.sender_id)
        .filter(|(_, m)| m.client_key.is_none() || incoming.client_key.is_none())
        .map(|(idx, m)| (idx, (m.created_at - incoming.created_at).abs()))
        .filter(|(_, gap)| *gap <= window)
        .min_by_key(|(_, gap)| *gap)
        .map(|(idx, _)| idx)
}

/// Apply a `message.insert` event.
pub fn apply_insert(
    snapshot: &mut SyncSnapshot,
    conversation_id: &str,
    message: Message,
    window: Duration,
) -> InsertOutcome {
    let from_viewer = viewer_id(snapshot) == message.sender_id;
    let is_active = snapshot.ui.is_active(conversation_id);

    let Some(conv) = snapshot.conversation_mut(conversation_id) else {
        return InsertOutcome::UnknownConversation;
    };
    if conv.contains(&message.id) {
        return InsertOutcome::Duplicate;
    }

    if from_viewer {
        if let Some(idx) = find_optimistic(conv, &message, window) {
            let temp_id = std::mem::replace(&mut conv.messages[idx], message).id;
            return InsertOutcome::Reconciled { temp_id };
        }
    }

    conv.add_message(message);
    let unread_incremented = !from_viewer && !is_active;
    if unread_incremented {
        conv.unread_count = conv.unread_count.saturating_add(1);
    }
    InsertOutcome::Inserted { unread_incremented }
}

/// Apply a `message.update` event: text and status only, position untouched.
pub fn apply_update(snapshot: &mut SyncSnapshot, conversation_id: &str, update: &Message) -> bool {
    let unchanged = snapshot
        .conversation(conversation_id)
        .and_then(|c| c.message(&update.id))
        .map_or(true, |m| m.text == update.text && m.status == update.status);
    if unchanged {
        return false;
    }

    let Some(msg) = snapshot
        .conversation_mut(conversation_id)
        .and_then(|c| c.messages.iter_mut().find(|m| m.id == update.id))
    else {
        return false;
    };
    msg.text.clone_from(&update.text);
    msg.status = update.status;
    true
}

/// Apply a watermark change. Watermarks never move backwards.
pub fn apply_watermark(
    snapshot: &mut SyncSnapshot,
    conversation_id: &str,
    user_id: &str,
    at: DateTime<Utc>,
) -> WatermarkOutcome {
    let viewer = viewer_id(snapshot).to_string();
    let advances = snapshot
        .conversation(conversation_id)
        .map(|c| c.watermark(user_id).map_or(true, |current| at > current));
    if advances != Some(true) {
        return WatermarkOutcome::Ignored;
    }
    let Some(conv) = snapshot.conversation_mut(conversation_id) else {
        return WatermarkOutcome::Ignored;
    };
    conv.set_watermark(user_id, at);

    if user_id == viewer {
        conv.unread_count = conv.count_unread(&viewer, Some(at));
        WatermarkOutcome::Read {
            unread_count: conv.unread_count,
        }
    } else {
        WatermarkOutcome::Receipt {
            delivered: conv.mark_delivered_until(&viewer, at),
        }
    }
}

/// Local read: move the viewer's watermark to the newest message and zero
/// unread. Returns the new watermark, or `None` when already read.
pub fn mark_read(snapshot: &mut SyncSnapshot, conversation_id: &str) -> Option<DateTime<Utc>> {
    let viewer = viewer_id(snapshot).to_string();
    let conv = snapshot.conversation(conversation_id)?;
    let newest = conv.last_activity();
    let up_to_date = conv.watermark(&viewer).is_some_and(|w| w >= newest);
    if up_to_date && conv.unread_count == 0 {
        return None;
    }

    let conv = snapshot.conversation_mut(conversation_id)?;
    let at = conv.watermark(&viewer).map_or(newest, |w| w.max(newest));
    conv.set_watermark(&viewer, at);
    conv.unread_count = 0;
    Some(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Viewer;
    use chrono::TimeZone;
    use chatsync_shared::{MessageStatus, Participant};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn snapshot() -> SyncSnapshot {
        let mut snapshot = SyncSnapshot {
            current_user: Some(Viewer::new("me")),
            ..SyncSnapshot::default()
        };
        snapshot.insert_conversation(Conversation::new(
            "c1",
            vec![Participant::new("me"), Participant::new("bob")],
            t(0),
        ));
        snapshot
    }

    fn msg(id: &str, sender: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: id.into(),
            client_key: None,
            sender_id: sender.into(),
            text: format!("text {id}"),
            created_at: at,
            status: MessageStatus::Sent,
            attachments: vec![],
            reactions: vec![],
        }
    }

    fn optimistic(key: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: format!("temp-{key}"),
            client_key: Some(key.into()),
            status: MessageStatus::Sending,
            ..msg("", "me", at)
        }
    }

    fn window() -> Duration {
        Duration::seconds(10)
    }

    fn conv(snapshot: &SyncSnapshot) -> &Conversation {
        snapshot.conversation("c1").unwrap()
    }

    #[test]
    fn insert_is_idempotent() {
        let mut s = snapshot();
        let m = msg("m1", "bob", t(1));
        assert_eq!(
            apply_insert(&mut s, "c1", m.clone(), window()),
            InsertOutcome::Inserted { unread_incremented: true }
        );
        assert_eq!(apply_insert(&mut s, "c1", m, window()), InsertOutcome::Duplicate);
        assert_eq!(conv(&s).messages.len(), 1);
        assert_eq!(conv(&s).unread_count, 1);
    }

    #[test]
    fn echo_replaces_optimistic_by_client_key() {
        let mut s = snapshot();
        s.conversation_mut("c1").unwrap().add_message(optimistic("k1", t(5)));
        s.conversation_mut("c1").unwrap().add_message(msg("m2", "bob", t(6)));

        let mut echo = msg("srv-1", "me", t(40));
        echo.client_key = Some("k1".into());
        assert_eq!(
            apply_insert(&mut s, "c1", echo, window()),
            InsertOutcome::Reconciled { temp_id: "temp-k1".into() }
        );
        let ids: Vec<&str> = conv(&s).messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["srv-1", "m2"]);
        assert_eq!(conv(&s).unread_count, 0);
    }

    #[test]
    fn echo_without_key_matches_recent_temp_from_same_sender() {
        let mut s = snapshot();
        s.conversation_mut("c1").unwrap().add_message(optimistic("k1", t(0)));

        let far = msg("srv-far", "me", t(30));
        assert_eq!(
            apply_insert(&mut s, "c1", far, window()),
            InsertOutcome::Inserted { unread_incremented: false }
        );

        let near = msg("srv-near", "me", t(4));
        assert!(matches!(
            apply_insert(&mut s, "c1", near, window()),
            InsertOutcome::Reconciled { .. }
        ));
        assert!(!conv(&s).messages.iter().any(|m| m.is_temporary()));
    }

    #[test]
    fn echo_with_foreign_key_leaves_pending_send_alone() {
        let mut s = snapshot();
        s.conversation_mut("c1").unwrap().add_message(optimistic("kb", t(0)));

        let mut other_device = msg("srv-x", "me", t(1));
        other_device.client_key = Some("kx".into());
        assert_eq!(
            apply_insert(&mut s, "c1", other_device, window()),
            InsertOutcome::Inserted { unread_incremented: false }
        );

        let ids: Vec<&str> = conv(&s).messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["temp-kb", "srv-x"]);
        assert_eq!(conv(&s).messages[0].text, "text ");
    }

    #[test]
    fn active_conversation_does_not_accumulate_unread() {
        let mut s = snapshot();
        s.ui.open("c1");
        apply_insert(&mut s, "c1", msg("m1", "bob", t(1)), window());
        assert_eq!(conv(&s).unread_count, 0);
    }

    #[test]
    fn unknown_conversation_is_reported() {
        let mut s = snapshot();
        assert_eq!(
            apply_insert(&mut s, "nope", msg("m1", "bob", t(1)), window()),
            InsertOutcome::UnknownConversation
        );
    }

    #[test]
    fn update_touches_text_and_status_only() {
        let mut s = snapshot();
        apply_insert(&mut s, "c1", msg("m1", "bob", t(1)), window());
        apply_insert(&mut s, "c1", msg("m2", "bob", t(2)), window());

        let mut edit = msg("m1", "mallory", t(99));
        edit.text = "edited".into();
        edit.status = MessageStatus::Delivered;
        assert!(apply_update(&mut s, "c1", &edit));
        assert!(!apply_update(&mut s, "c1", &edit));

        let first = &conv(&s).messages[0];
        assert_eq!(first.id, "m1");
        assert_eq!(first.text, "edited");
        assert_eq!(first.sender_id, "bob");
        assert_eq!(first.created_at, t(1));
        assert!(!apply_update(&mut s, "c1", &msg("missing", "bob", t(1))));
    }

    #[test]
    fn viewer_watermark_recomputes_unread() {
        let mut s = snapshot();
        for i in 1..=3 {
            apply_insert(&mut s, "c1", msg(&format!("m{i}"), "bob", t(i)), window());
        }
        assert_eq!(
            apply_watermark(&mut s, "c1", "me", t(2)),
            WatermarkOutcome::Read { unread_count: 1 }
        );
        assert_eq!(apply_watermark(&mut s, "c1", "me", t(1)), WatermarkOutcome::Ignored);
        assert_eq!(conv(&s).unread_count, 1);
    }

    #[test]
    fn foreign_watermark_delivers_own_messages() {
        let mut s = snapshot();
        apply_insert(&mut s, "c1", msg("mine-1", "me", t(1)), window());
        apply_insert(&mut s, "c1", msg("mine-2", "me", t(5)), window());
        assert_eq!(
            apply_watermark(&mut s, "c1", "bob", t(3)),
            WatermarkOutcome::Receipt { delivered: 1 }
        );
        let statuses: Vec<MessageStatus> = conv(&s).messages.iter().map(|m| m.status).collect();
        assert_eq!(statuses, [MessageStatus::Delivered, MessageStatus::Sent]);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let mut s = snapshot();
        apply_insert(&mut s, "c1", msg("m1", "bob", t(1)), window());
        assert_eq!(mark_read(&mut s, "c1"), Some(t(1)));
        assert_eq!(conv(&s).unread_count, 0);
        assert_eq!(mark_read(&mut s, "c1"), None);
    }
}
