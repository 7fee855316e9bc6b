mod common;

use std::time::Duration;

use chatsync_client::{ChannelKey, LoopbackFeed, SubscriptionState, SyncConfig, SyncEngine};
use chatsync_shared::{
    conversation_channel, global_channel, ChannelStatus, ConversationRef, ConversationSummary,
    FeedEvent, MessageStatus, Participant, SyncError, TransportError,
};
use chrono::{Duration as ChronoDuration, Utc};

use common::{deliver, engine, engine_with, row, settle, summary};

#[tokio::test(start_paused = true)]
async fn unread_follows_watermark_scenario() {
    let t0 = Utc::now() - ChronoDuration::hours(1);
    let feed = LoopbackFeed::new();
    feed.add_conversation(ConversationSummary {
        id: "c1".into(),
        participants: vec![
            Participant::new("me").with_last_read_at(t0),
            Participant::new("bob"),
        ],
    });
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    for i in 1..=3 {
        deliver(&feed, row("c1", &format!("m{i}"), "bob", t0 + ChronoDuration::seconds(i)));
    }
    settle().await;
    assert_eq!(me.snapshot().conversation("c1").unwrap().unread_count, 3);
    assert_eq!(me.total_unread_count(), 3);

    me.mark_conversation_as_read("c1").await.unwrap();
    settle().await;
    assert_eq!(me.snapshot().conversation("c1").unwrap().unread_count, 0);
    assert_eq!(feed.watermark("c1", "me"), Some(t0 + ChronoDuration::seconds(3)));

    deliver(&feed, row("c1", "m4", "bob", t0 + ChronoDuration::seconds(4)));
    settle().await;
    assert_eq!(me.snapshot().conversation("c1").unwrap().unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn send_then_echo_leaves_exactly_one_message() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me", "bob"]));
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    let sent = me.send_message("c1", "hello", vec![]).await.unwrap();
    settle().await;

    let snapshot = me.snapshot();
    let conv = snapshot.conversation("c1").unwrap();
    assert_eq!(conv.messages.len(), 1);
    assert_eq!(conv.messages[0].id, sent.id);
    assert!(!conv.messages[0].is_temporary());
    assert_eq!(conv.messages[0].status, MessageStatus::Sent);
    assert_eq!(conv.unread_count, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_send_rolls_back_the_optimistic_message() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me"]));
    feed.fail_inserts(1);
    let me = engine(&feed, "me");
    me.start().await.unwrap();

    let result = me.send_message("c1", "lost", vec![]).await;
    assert!(matches!(result, Err(SyncError::SendFailed(_))));
    assert!(me.snapshot().conversation("c1").unwrap().messages.is_empty());

    // No automatic retry.
    settle().await;
    assert!(feed.rows("c1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_conversation_is_rejected() {
    let feed = LoopbackFeed::new();
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    assert_eq!(
        me.send_message("nope", "hi", vec![]).await,
        Err(SyncError::UnknownConversation("nope".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_deliveries_are_ignored() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me", "bob"]));
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    let message = row("c1", "m1", "bob", Utc::now());
    deliver(&feed, message.clone());
    deliver(&feed, message);
    settle().await;

    let snapshot = me.snapshot();
    let conv = snapshot.conversation("c1").unwrap();
    assert_eq!(conv.messages.len(), 1);
    assert_eq!(conv.unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me", "bob"]));
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    let channel = conversation_channel("c1");
    feed.emit_raw(&channel, "{not json");
    feed.emit_raw(&channel, r#"{"id":"x","type":"message.exploded","data":{},"ts":"2024-05-01T12:00:00Z"}"#);
    deliver(&feed, row("c1", "temp-forged", "bob", Utc::now()));
    deliver(&feed, row("c1", "m1", "bob", Utc::now()));
    settle().await;

    let snapshot = me.snapshot();
    let ids: Vec<&str> = snapshot
        .conversation("c1")
        .unwrap()
        .messages
        .iter()
        .map(|m| m.id.as_str())
        .collect();
    assert_eq!(ids, ["m1"]);
}

#[tokio::test(start_paused = true)]
async fn updates_change_text_and_status_in_place() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me", "bob"]));
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    let now = Utc::now();
    deliver(&feed, row("c1", "m1", "bob", now));
    deliver(&feed, row("c1", "m2", "bob", now + ChronoDuration::seconds(1)));
    settle().await;

    let mut edited = row("c1", "m1", "bob", now + ChronoDuration::seconds(60));
    edited.content = "edited".into();
    feed.emit(&conversation_channel("c1"), &FeedEvent::MessageUpdate(edited));
    settle().await;

    let snapshot = me.snapshot();
    let conv = snapshot.conversation("c1").unwrap();
    assert_eq!(conv.messages[0].id, "m1");
    assert_eq!(conv.messages[0].text, "edited");
    assert_eq!(conv.messages[0].created_at, now);
}

#[tokio::test(start_paused = true)]
async fn history_loads_with_unread_from_watermark() {
    let t0 = Utc::now() - ChronoDuration::hours(2);
    let feed = LoopbackFeed::new();
    feed.add_conversation(ConversationSummary {
        id: "c1".into(),
        participants: vec![
            Participant::new("me").with_last_read_at(t0 + ChronoDuration::seconds(1)),
            Participant::new("bob"),
        ],
    });
    feed.seed_row(row("c1", "old", "bob", t0));
    feed.seed_row(row("c1", "new-2", "bob", t0 + ChronoDuration::seconds(3)));
    feed.seed_row(row("c1", "new-1", "bob", t0 + ChronoDuration::seconds(2)));
    feed.seed_row(row("c1", "mine", "me", t0 + ChronoDuration::seconds(4)));

    let me = engine(&feed, "me");
    me.start().await.unwrap();

    let snapshot = me.snapshot();
    assert!(!snapshot.loading);
    let conv = snapshot.conversation("c1").unwrap();
    assert!(conv.is_loaded);
    let ids: Vec<&str> = conv.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["old", "new-1", "new-2", "mine"]);
    assert_eq!(conv.unread_count, 2);
}

#[tokio::test(start_paused = true)]
async fn opening_marks_read_and_sends_receipts() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["alice", "bob"]));
    let alice = engine(&feed, "alice");
    let bob = engine(&feed, "bob");
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    settle().await;

    alice.send_message("c1", "ping", vec![]).await.unwrap();
    settle().await;
    assert_eq!(bob.total_unread_count(), 1);

    bob.open_conversation("c1").await.unwrap();
    settle().await;
    assert_eq!(bob.total_unread_count(), 0);
    assert!(bob.snapshot().ui.is_active("c1"));

    let snapshot = alice.snapshot();
    let conv = snapshot.conversation("c1").unwrap();
    assert_eq!(conv.messages[0].status, MessageStatus::Delivered);

    // While open, new messages raise no unread but stay unread until marked.
    alice.send_message("c1", "still there?", vec![]).await.unwrap();
    settle().await;
    assert_eq!(bob.total_unread_count(), 0);
    let status = |engine: &SyncEngine| {
        engine.snapshot().conversation("c1").unwrap().messages[1].status
    };
    assert_ne!(status(&alice), MessageStatus::Delivered);

    bob.mark_conversation_as_read("c1").await.unwrap();
    settle().await;
    assert_eq!(status(&alice), MessageStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn typing_reaches_the_other_viewer_and_expires() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["alice", "bob"]));
    let alice = engine(&feed, "alice");
    let bob = engine(&feed, "bob");
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    settle().await;

    for _ in 0..5 {
        alice.send_typing_indicator("c1", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let snapshot = bob.snapshot();
    let conv = snapshot.conversation("c1").unwrap();
    assert!(conv.is_typing);
    assert_eq!(conv.typing_user.as_deref(), Some("alice"));
    assert!(!alice.snapshot().conversation("c1").unwrap().is_typing);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!bob.snapshot().conversation("c1").unwrap().is_typing);

    let published: Vec<bool> = feed
        .published()
        .into_iter()
        .map(|(_, _, payload)| payload["isTyping"].as_bool().unwrap())
        .collect();
    assert_eq!(published, [true, false]);
}

#[tokio::test(start_paused = true)]
async fn sending_stops_typing() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["alice", "bob"]));
    let alice = engine(&feed, "alice");
    alice.start().await.unwrap();

    alice.send_typing_indicator("c1", true).await.unwrap();
    alice.send_message("c1", "done typing", vec![]).await.unwrap();

    let published: Vec<bool> = feed
        .published()
        .into_iter()
        .map(|(_, _, payload)| payload["isTyping"].as_bool().unwrap())
        .collect();
    assert_eq!(published, [true, false]);
}

#[tokio::test(start_paused = true)]
async fn typing_in_unknown_conversation_is_rejected() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["alice", "bob"]));
    let alice = engine(&feed, "alice");
    alice.start().await.unwrap();

    assert_eq!(
        alice.send_typing_indicator("nope", true).await,
        Err(SyncError::UnknownConversation("nope".into()))
    );
    assert!(feed.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn joined_and_left_conversations_follow_the_global_channel() {
    let feed = LoopbackFeed::new();
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    feed.add_conversation(summary("c2", &["me", "bob"]));
    settle().await;
    let snapshot = me.snapshot();
    assert!(snapshot.conversation("c2").unwrap().is_loaded);
    assert_eq!(feed.subscriber_count(&conversation_channel("c2")), 1);

    feed.emit(
        &global_channel("me"),
        &FeedEvent::ConversationLeft(ConversationRef {
            conversation_id: "c2".into(),
        }),
    );
    settle().await;
    assert!(!me.snapshot().contains("c2"));
    assert_eq!(feed.subscriber_count(&conversation_channel("c2")), 0);
}

#[tokio::test(start_paused = true)]
async fn eviction_keeps_unread_and_visible_conversations() {
    let feed = LoopbackFeed::new();
    for id in ["unread", "open", "idle"] {
        feed.add_conversation(summary(id, &["me", "bob"]));
    }
    let config = SyncConfig {
        max_conversations: 0,
        eviction_interval: Duration::from_secs(60),
        ..SyncConfig::default()
    };
    let me = engine_with(&feed, "me", config);
    me.start().await.unwrap();
    settle().await;

    deliver(&feed, row("unread", "m1", "bob", Utc::now()));
    me.open_conversation("open").await.unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    let snapshot = me.snapshot();
    assert!(snapshot.contains("unread"));
    assert!(snapshot.contains("open"));
    assert!(!snapshot.contains("idle"));
    assert_eq!(feed.subscriber_count(&conversation_channel("idle")), 0);
    assert_eq!(feed.subscriber_count(&conversation_channel("unread")), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_channel_gives_up_and_reopening_retries() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me"]));
    feed.fail_subscribes("conversation:", None, ChannelStatus::ChannelError);
    let me = engine(&feed, "me");
    me.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    let key = ChannelKey::conversation("c1");
    assert_eq!(feed.subscribe_calls("conversation:c1"), 3);
    assert!(matches!(
        me.subscription_state(&key),
        Some(SubscriptionState::Failed { .. })
    ));
    assert_eq!(
        me.subscription_state(&ChannelKey::Global),
        Some(SubscriptionState::Subscribed)
    );

    me.open_conversation("c1").await.unwrap();
    settle().await;
    assert_eq!(feed.subscribe_calls("conversation:c1"), 4);
}

#[tokio::test(start_paused = true)]
async fn opening_with_failed_history_still_resubscribes() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me", "bob"]));
    feed.fail_subscribes("conversation:", Some(3), ChannelStatus::ChannelError);
    feed.fail_history_loads(2);
    let me = engine(&feed, "me");
    me.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    let key = ChannelKey::conversation("c1");
    assert!(matches!(
        me.subscription_state(&key),
        Some(SubscriptionState::Failed { .. })
    ));

    let result = me.open_conversation("c1").await;
    assert!(matches!(
        result,
        Err(SyncError::Transport(TransportError::Timeout))
    ));
    settle().await;
    assert_eq!(feed.subscribe_calls("conversation:c1"), 4);
    assert_eq!(me.subscription_state(&key), Some(SubscriptionState::Subscribed));
    assert!(me.snapshot().ui.is_active("c1"));
    assert!(!me.snapshot().conversation("c1").unwrap().is_loaded);

    me.load_conversation("c1").await.unwrap();
    assert!(me.snapshot().conversation("c1").unwrap().is_loaded);
}

#[tokio::test(start_paused = true)]
async fn broken_channel_reconnects() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me", "bob"]));
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;

    let channel = conversation_channel("c1");
    feed.break_channel(&channel, ChannelStatus::Closed);
    settle().await;
    assert_eq!(feed.subscriber_count(&channel), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(feed.subscriber_count(&channel), 1);
    assert_eq!(
        me.subscription_state(&ChannelKey::conversation("c1")),
        Some(SubscriptionState::Subscribed)
    );

    deliver(&feed, row("c1", "m1", "bob", Utc::now()));
    settle().await;
    assert_eq!(me.total_unread_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_releases_everything() {
    let feed = LoopbackFeed::new();
    feed.add_conversation(summary("c1", &["me"]));
    let me = engine(&feed, "me");
    me.start().await.unwrap();
    settle().await;
    assert_eq!(feed.subscriber_count(&global_channel("me")), 1);

    me.stop().await;
    me.stop().await;
    assert_eq!(feed.subscriber_count(&global_channel("me")), 0);
    assert_eq!(feed.subscriber_count(&conversation_channel("c1")), 0);
    assert_eq!(
        me.send_message("c1", "too late", vec![]).await,
        Err(SyncError::NotRunning)
    );
}
