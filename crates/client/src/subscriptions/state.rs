//! Channel lifecycle states and retry policy.

use std::time::Duration;

use chatsync_shared::ChannelSpec;

/// Lifecycle of one channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Subscribed,
    Retrying { attempt: u32 },
    Failed { reason: String },
}

impl SubscriptionState {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscriptionState::Subscribed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SubscriptionState::Failed { .. })
    }
}

/// Bounded exponential backoff for subscribe attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Subscribe attempts before the channel is marked failed.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for per-conversation channels.
    pub fn conversation() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Policy for the viewer's global channel.
    pub fn global() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(15),
        }
    }

    /// `min(base * 2^retry_count, cap)`
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conversation()
    }
}

/// Identifies a channel in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    Global,
    Conversation(String),
}

impl ChannelKey {
    pub fn conversation(id: impl Into<String>) -> Self {
        ChannelKey::Conversation(id.into())
    }

    pub fn spec(&self, viewer_id: &str) -> ChannelSpec {
        match self {
            ChannelKey::Global => ChannelSpec::global(viewer_id),
            ChannelKey::Conversation(id) => ChannelSpec::conversation(id),
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKey::Global => f.write_str("global"),
            ChannelKey::Conversation(id) => write!(f, "conversation {id}"),
        }
    }
}
