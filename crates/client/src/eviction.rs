//! Periodic eviction of stale conversations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::stores::{MessageStore, SyncSnapshot};
use crate::subscriptions::SubscriptionManager;
use crate::typing::TypingSignaler;

/// Limits applied by a sweep.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Unprotected conversations kept by recency.
    pub max_conversations: usize,
    /// Unprotected conversations idle longer than this are dropped.
    pub max_age: Duration,
}

/// Conversations the UI relies on or the viewer still has to read.
fn is_protected(snapshot: &SyncSnapshot, conversation_id: &str, unread_count: u32) -> bool {
    unread_count > 0 || snapshot.ui.is_visible(conversation_id)
}

/// Ids to evict from `snapshot` at `now`, sorted.
pub fn plan(snapshot: &SyncSnapshot, now: DateTime<Utc>, policy: EvictionPolicy) -> Vec<String> {
    let max_age = chrono::Duration::from_std(policy.max_age).unwrap_or(chrono::Duration::MAX);

    let mut candidates: Vec<(&str, DateTime<Utc>)> = snapshot
        .conversations
        .values()
        .filter(|c| !is_protected(snapshot, &c.id, c.unread_count))
        .map(|c| (c.id.as_str(), c.last_activity()))
        .collect();
    // Most recent first; id breaks ties so the plan is deterministic.
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut evicted: Vec<String> = candidates
        .into_iter()
        .enumerate()
        .filter(|(rank, (_, last_activity))| {
            *rank >= policy.max_conversations
                || now.signed_duration_since(*last_activity) > max_age
        })
        .map(|(_, (id, _))| id.to_string())
        .collect();
    evicted.sort();
    evicted
}

/// Applies eviction plans to the store, typing timers and subscriptions.
#[derive(Clone)]
pub struct EvictionManager {
    store: MessageStore,
    typing: TypingSignaler,
    subscriptions: SubscriptionManager,
    policy: EvictionPolicy,
}

impl EvictionManager {
    pub fn new(
        store: MessageStore,
        typing: TypingSignaler,
        subscriptions: SubscriptionManager,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            store,
            typing,
            subscriptions,
            policy,
        }
    }

    /// Run one sweep. Returns the evicted ids.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let evicted = plan(&self.store.snapshot(), now, self.policy);
        for id in &evicted {
            self.store.remove_conversation(id);
            self.typing.clear(id);
        }
        if !evicted.is_empty() {
            crate::log_info!("Evicted {} conversations", evicted.len());
        }
        self.subscriptions
            .sync_with(&self.store.snapshot().conversation_ids())
            .await;
        evicted
    }

    /// Sweep every `period`, starting one period from now.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Utc::now()).await;
            }
        })
    }
}
