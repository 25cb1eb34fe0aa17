//! Local replica records.
//!
//! - [`Board`] - a board (scope), optionally bound to a shared relay scope
//! - [`Task`] - a task (entity) owned by one board
//!
//! The bounty escrow attached to a task lives in [`crate::bounty`].

mod board;
mod task;

pub use board::{Board, BoardKind, Column, NostrBinding, WEEK_COLUMNS};
pub use task::{Document, Recurrence, RecurrenceUnit, Subtask, Task};
