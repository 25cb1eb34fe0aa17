//! Error types for taskrelay-sync.

use thiserror::Error;

/// Result type for taskrelay-sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the replication engine.
///
/// Stale events and denied bounty transitions are not errors; they come back
/// as [`crate::ApplyOutcome`] values.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Relay transport refused the work (no relays, dead link).
    #[error("transport error: {0}")]
    Transport(#[from] taskrelay_relay::Error),

    /// Event id or signature check failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Envelope did not open and the content is not cleartext JSON.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Payload JSON did not match its schema.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Board has no relay binding, so it cannot be published.
    #[error("board {0} is not shared")]
    NotShared(String),

    /// Event names a scope tag no local board is bound to.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// Board id is not known locally.
    #[error("unknown board: {0}")]
    UnknownBoard(String),

    /// Key/value store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// The publisher task has stopped.
    #[error("publisher closed")]
    PublisherClosed,

    /// Protocol-level failure (signing, key parsing).
    #[error("protocol error: {0}")]
    Protocol(#[from] taskrelay_protocol::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
