//! Engine configuration from environment variables.

use std::time::Duration;

use crate::subscriptions::RetryPolicy;

/// Tunables for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backoff for per-conversation channels.
    pub conversation_retry: RetryPolicy,
    /// Backoff for the viewer's global channel.
    pub global_retry: RetryPolicy,
    /// Idle time after the last keystroke before typing-stop is published.
    pub typing_idle: Duration,
    /// How long a remote typing flag survives without a refresh.
    pub remote_typing_timeout: Duration,
    /// Period of the eviction sweep.
    pub eviction_interval: Duration,
    /// Conversations kept by recency, on top of protected ones.
    pub max_conversations: usize,
    /// Unprotected conversations idle for longer than this are dropped.
    pub max_conversation_age: Duration,
    /// Window for correlating an echo with an optimistic message lacking a key.
    pub optimistic_match_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_retry: RetryPolicy::conversation(),
            global_retry: RetryPolicy::global(),
            typing_idle: Duration::from_secs(1),
            remote_typing_timeout: Duration::from_secs(3),
            eviction_interval: Duration::from_secs(5 * 60),
            max_conversations: 30,
            max_conversation_age: Duration::from_secs(7 * 24 * 60 * 60),
            optimistic_match_window: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by environment variables.
    ///
    /// Environment variables:
    /// - `CHATSYNC_RETRY_ATTEMPTS`: attempts per channel before giving up (default: 3)
    /// - `CHATSYNC_RETRY_BASE_MS` / `CHATSYNC_RETRY_CAP_MS`: conversation backoff (default: 2000 / 8000)
    /// - `CHATSYNC_GLOBAL_RETRY_BASE_MS` / `CHATSYNC_GLOBAL_RETRY_CAP_MS`: global backoff (default: 3000 / 15000)
    /// - `CHATSYNC_TYPING_IDLE_MS`: typing debounce window (default: 1000)
    /// - `CHATSYNC_REMOTE_TYPING_MS`: remote typing expiry (default: 3000)
    /// - `CHATSYNC_MATCH_WINDOW_SECS`: optimistic echo matching window (default: 10)
    /// - `CHATSYNC_EVICTION_INTERVAL_SECS`: sweep period (default: 300)
    /// - `CHATSYNC_MAX_CONVERSATIONS`: recency budget (default: 30)
    /// - `CHATSYNC_MAX_AGE_SECS`: idle age limit (default: 604800)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(attempts) = env_parse::<u32>("CHATSYNC_RETRY_ATTEMPTS") {
            config.conversation_retry.max_attempts = attempts;
            config.global_retry.max_attempts = attempts;
        }
        if let Some(ms) = env_parse("CHATSYNC_RETRY_BASE_MS") {
            config.conversation_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHATSYNC_RETRY_CAP_MS") {
            config.conversation_retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHATSYNC_GLOBAL_RETRY_BASE_MS") {
            config.global_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHATSYNC_GLOBAL_RETRY_CAP_MS") {
            config.global_retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHATSYNC_TYPING_IDLE_MS") {
            config.typing_idle = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("CHATSYNC_REMOTE_TYPING_MS") {
            config.remote_typing_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("CHATSYNC_MATCH_WINDOW_SECS") {
            config.optimistic_match_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CHATSYNC_EVICTION_INTERVAL_SECS") {
            config.eviction_interval = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse("CHATSYNC_MAX_CONVERSATIONS") {
            config.max_conversations = max;
        }
        if let Some(secs) = env_parse("CHATSYNC_MAX_AGE_SECS") {
            config.max_conversation_age = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            crate::log_warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}
