//! chatsync - demo entry point
//!
//! Runs two viewers against one in-process feed, exchanges a few messages
//! and typing signals, and prints what each viewer ends up seeing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatsync_client::{logging, LoopbackFeed, SyncConfig, SyncEngine, SyncSnapshot, Viewer};
use chatsync_shared::{ConversationSummary, Participant};

fn engine_for(feed: &LoopbackFeed, config: &SyncConfig, user_id: &str, name: &str) -> SyncEngine {
    let conn = Arc::new(feed.connect());
    let mut viewer = Viewer::new(user_id);
    viewer.display_name = Some(name.to_string());
    SyncEngine::new(config.clone(), viewer, conn.clone(), conn)
}

fn print_snapshot(label: &str, snapshot: &SyncSnapshot) {
    println!("== {label} (unread total: {})", snapshot.total_unread_count());
    let mut ids = snapshot.conversation_ids();
    ids.sort();
    for id in ids {
        let Some(conv) = snapshot.conversation(&id) else {
            continue;
        };
        let typing = conv.typing_user.as_deref().unwrap_or("-");
        println!("  [{id}] unread={} typing={typing}", conv.unread_count);
        for msg in &conv.messages {
            println!(
                "    {} {:<6} {:?}: {}",
                msg.created_at.format("%H:%M:%S%.3f"),
                msg.sender_id,
                msg.status,
                msg.text
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = SyncConfig::from_env();
    let feed = LoopbackFeed::new();
    feed.add_conversation(ConversationSummary {
        id: "general".to_string(),
        participants: vec![
            Participant::new("alice").with_display_name("Alice"),
            Participant::new("bob").with_display_name("Bob"),
        ],
    });

    let alice = engine_for(&feed, &config, "alice", "Alice");
    let bob = engine_for(&feed, &config, "bob", "Bob");
    alice.start().await.context("starting alice")?;
    bob.start().await.context("starting bob")?;

    alice.open_conversation("general").await?;
    alice.send_typing_indicator("general", true).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_snapshot("bob while alice types", &bob.snapshot());

    alice.send_message("general", "hey bob", vec![]).await?;
    alice.send_message("general", "are you around?", vec![]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_snapshot("bob before reading", &bob.snapshot());

    bob.open_conversation("general").await?;
    bob.send_message("general", "yes, here", vec![]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    print_snapshot("alice", &alice.snapshot());
    print_snapshot("bob", &bob.snapshot());

    alice.stop().await;
    bob.stop().await;
    Ok(())
}
