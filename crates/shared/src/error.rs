//! Error types shared by the engine and transports.

use thiserror::Error;

/// A frame that could not be narrowed into a feed event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("feed row carries a temporary id: {0}")]
    TemporaryId(String),
}

/// Failure reported by the network boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced to callers of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("message could not be sent: {0}")]
    SendFailed(TransportError),
    #[error("sync engine is not running")]
    NotRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
