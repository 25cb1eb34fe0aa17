//! Error types for taskrelay-protocol.

use thiserror::Error;

/// Result type for taskrelay-protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, verifying or decoding events.
#[derive(Debug, Error)]
pub enum Error {
    /// Key material could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Event id does not match its content hash.
    #[error("event id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    /// Schnorr signature did not verify.
    #[error("invalid signature on event {0}")]
    InvalidSignature(String),

    /// Signing failed inside the curve library.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Envelope could not be opened with the given key.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Envelope could not be sealed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Relay frame was not a recognised message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hex decoding error.
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),
}
