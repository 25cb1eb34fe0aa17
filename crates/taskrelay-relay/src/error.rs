//! Error types for taskrelay-relay.

use thiserror::Error;

/// Result type for taskrelay-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when handing work to the relay pool.
///
/// Connection failures are never reported here; links retry on their own.
#[derive(Debug, Error)]
pub enum Error {
    /// No relay URLs were given for a publish or subscribe.
    #[error("no relays configured")]
    NoRelays,

    /// URL is not a ws:// or wss:// endpoint.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// The link's background task has stopped.
    #[error("relay link closed: {0}")]
    LinkClosed(String),

    /// Frame could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] taskrelay_protocol::Error),
}
