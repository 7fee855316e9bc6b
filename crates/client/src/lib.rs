//! chatsync client - realtime conversation sync engine
//!
//! Keeps a viewer's conversations, messages, unread counts and typing state
//! consistent with a pub-sub feed, with optimistic sends reconciled against
//! the server's echo.

pub mod logging;

pub mod config;
pub mod engine;
pub mod eviction;
pub mod reconcile;
pub mod session;
pub mod stores;
pub mod subscriptions;
pub mod transport;
pub mod typing;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use session::Viewer;
pub use stores::{Conversation, MessageStore, SyncSnapshot, UiState};
pub use subscriptions::{ChannelKey, RetryPolicy, SubscriptionManager, SubscriptionState};
pub use transport::{HistoryStore, InboundFrame, LoopbackFeed, LoopbackTransport, Transport};
pub use typing::TypingSignaler;
