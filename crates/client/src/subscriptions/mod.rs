//! Subscription manager: one channel per conversation plus the viewer's
//! global channel.
//!
//! ```text
//!   Idle ──▶ Connecting ──▶ Subscribed
//!               ▲   │            │
//!               │   ▼            ▼ (error/timeout/close)
//!             Retrying ◀─────────┘
//!                 │
//!                 ▼ (attempts exhausted)
//!               Failed
//! ```

mod manager;
mod state;

pub use manager::{SubscriptionHandle, SubscriptionManager};
pub use state::{ChannelKey, RetryPolicy, SubscriptionState};
