//! Taskrelay Protocol - signed events, relay frames and payload envelopes
//!
//! This crate defines everything that crosses the wire between a taskrelay
//! client and a relay:
//!
//! - [`Event`]: the immutable signed record (`id`, `kind`, `pubkey`,
//!   `created_at`, `tags`, `content`, `sig`), with BIP-340 signing and
//!   verification over the canonical id hash.
//! - [`ClientMessage`] / [`RelayMessage`]: JSON array frames (`REQ`,
//!   `EVENT`, `CLOSE`, `EOSE`, `OK`, `NOTICE`, `CLOSED`).
//! - [`envelope`]: the scope-shared symmetric envelope used for board and
//!   task payloads, and the two bounty token envelopes.
//!
//! # Example
//!
//! ```rust
//! use taskrelay_protocol::{Identity, UnsignedEvent, KIND_ENTITY};
//!
//! let identity = Identity::generate();
//! let event = UnsignedEvent::new(KIND_ENTITY, "{}")
//!     .tag("d", "task-1")
//!     .sign(&identity, 1_700_000_000)
//!     .unwrap();
//! assert!(event.verify().is_ok());
//! ```

pub mod envelope;
pub mod error;
pub mod event;
pub mod keys;
pub mod message;

pub use envelope::{BountyEnvelope, BountyScheme, ScopeKey};
pub use error::{Error, Result};
pub use event::{Event, Tags, UnsignedEvent, KIND_ENTITY, KIND_SCOPE_METADATA};
pub use keys::{Identity, PublicKeyHex};
pub use message::{ClientMessage, Filter, RelayMessage};
