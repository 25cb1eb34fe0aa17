//! Taskrelay Sync - replication and conflict resolution for shared boards
//!
//! # Overview
//!
//! Every client keeps a full replica of its boards and tasks and converges
//! with other clients only by exchanging signed events through relays:
//!
//! ```text
//!   local edit ─→ SyncEngine (optimistic) ─→ Publisher ─→ RelayPool ─→ relays
//!                                                                      │
//!   replica ◄─ merge ◄─ admission ◄─ envelope ◄─ verify ◄─ Subscription ◄┘
//! ```
//!
//! - [`clock`] - logical clocks, tombstones and the pending-publish set
//! - [`board_merge`] / [`task_merge`] - field-level merge rules
//! - [`bounty`] - authorization-gated escrow state machine
//! - [`publisher`] - ordered, spaced, strictly increasing publishes
//! - [`engine`] - the [`SyncEngine`] tying it all together
//!
//! Convergence holds for any arrival order and any amount of duplicate
//! delivery; there is no coordination between clients. Bounties are
//! admitted by their own `updatedAt`, so a task event that loses the task
//! clock can still deliver an authorized bounty change.

pub mod board_merge;
pub mod bounty;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod field;
pub mod models;
pub mod payload;
pub mod publisher;
pub mod scope;
pub mod store;
pub mod task_merge;

pub use bounty::{Bounty, BountyState};
pub use clock::{Admission, EntityClock, ReplicationState, SharedReplicationState};
pub use config::SyncConfig;
pub use engine::{
    ApplyOutcome, EngineOptions, EngineStats, PublishOptions, RejectReason, ScopeSubscription,
    SyncEngine,
};
pub use error::{Result, SyncError};
pub use field::Field;
pub use models::{Board, BoardKind, Column, NostrBinding, Task};
pub use payload::{ScopeMetadataV1, TaskStatus, TaskV1};
pub use publisher::{EventSink, PublishHandle, PublisherConfig, RetryPolicy, SystemClock, WallClock};
pub use scope::{scope_tag, Keyring};
pub use store::{FileStore, KeyValueStore, MemoryStore};
