//! Task model.

use serde::{Deserialize, Serialize};

use crate::bounty::Bounty;
use crate::publisher::unix_now;

/// Unit of an `every N units` recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceUnit {
    Hour,
    Day,
    Week,
}

/// Repeat rule for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Recurrence {
    None,
    Daily,
    /// Days of week, 0 = Sunday.
    Weekly { days: Vec<u8> },
    Every { n: u32, unit: RecurrenceUnit },
    MonthlyDay { day: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
}

/// Attached document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    /// MIME type.
    pub kind: String,
    /// Data URL or remote URL.
    pub data: String,
}

/// A task in the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Client-generated UUID, immutable.
    pub id: String,

    /// Local id of the owning board.
    pub board_id: String,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Due time, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<i64>,

    #[serde(default)]
    pub completed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,

    /// Column id within the board.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    /// Ordering index within the column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streak: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longest_streak: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Subtask>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Document>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounty: Option<Bounty>,

    /// Reminder offsets in minutes. Device-local; never synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminders: Option<Vec<i64>>,

    /// Public key of the creator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// Creation time, unix seconds.
    #[serde(default)]
    pub created_at: u64,
}

impl Task {
    /// New open task with a fresh id.
    pub fn new(board_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), board_id, title, unix_now())
    }

    pub fn with_id(
        id: impl Into<String>,
        board_id: impl Into<String>,
        title: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            board_id: board_id.into(),
            title: title.into(),
            note: None,
            due: None,
            completed: false,
            completed_at: None,
            column: None,
            order: None,
            recurrence: None,
            streak: None,
            longest_streak: None,
            subtasks: None,
            images: None,
            documents: None,
            bounty: None,
            reminders: None,
            created_by: None,
            created_at,
        }
    }
}
