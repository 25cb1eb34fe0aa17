//! Taskrelay Relay - persistent relay links and the relay pool
//!
//! # Architecture
//!
//! ```text
//!   subscribe / publish
//!          │
//!   ┌──────▼──────┐   one link per URL    ┌────────────┐
//!   │  RelayPool  │ ─────────────────────→│ RelayLink  │──→ wss://relay-a
//!   │             │ ─────────────────────→│ RelayLink  │──→ wss://relay-b
//!   │ dispatcher  │←── Inbound frames ─────└────────────┘
//!   └──────┬──────┘
//!          ▼
//!   Subscription (per subscription id)
//! ```
//!
//! Links are best-effort: they queue while down, replay subscriptions on
//! reconnect and retry forever after a fixed delay. The pool never awaits an
//! acknowledgment; a publish succeeds once a link has the frame.

pub mod error;
pub mod link;
pub mod pool;

pub use error::{Error, Result};
pub use link::{Inbound, LinkStatus, RelayConfig, RelayLink};
pub use pool::{RelayPool, Subscription, SubscriptionEvent};
