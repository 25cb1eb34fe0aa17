//! Versioned payload schemas and event tag names.
//!
//! Payloads are validated here, at the deserialization boundary. Removable
//! task fields use [`Field`] so that `null` (cleared) and a missing key
//! (untouched) stay distinct.

use serde::{Deserialize, Serialize};

use crate::bounty::Bounty;
use crate::field::Field;
use crate::models::{Board, BoardKind, Column, Document, Recurrence, Subtask, Task};

/// Replaceable-event address (scope tag or task id).
pub const TAG_ADDRESS: &str = "d";
/// Scope tag.
pub const TAG_SCOPE: &str = "b";
/// Board kind discriminator.
pub const TAG_KIND: &str = "k";
pub const TAG_NAME: &str = "name";
pub const TAG_COLUMN: &str = "col";
pub const TAG_STATUS: &str = "status";

/// Value of a task event's `status` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    Done,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Done => "done",
            TaskStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(TaskStatus::Open),
            "done" => Some(TaskStatus::Done),
            "deleted" => Some(TaskStatus::Deleted),
            _ => None,
        }
    }

    pub fn of(task: &Task) -> Self {
        if task.completed {
            TaskStatus::Done
        } else {
            TaskStatus::Open
        }
    }
}

/// Board metadata payload. Name and kind travel as tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMetadataV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,

    /// Shared board ids of compound children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_completed_disabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_card_enabled: Option<bool>,
}

impl ScopeMetadataV1 {
    /// Build from a local board. `shared_child_id` maps a child's local id
    /// to the id other clients know it by.
    pub fn from_board<F>(board: &Board, shared_child_id: F) -> Self
    where
        F: Fn(&str) -> String,
    {
        let (columns, children) = match &board.kind {
            BoardKind::Lists { columns } => (Some(columns.clone()), None),
            BoardKind::Compound { children } => (
                None,
                Some(children.iter().map(|c| shared_child_id(c)).collect()),
            ),
            BoardKind::Week | BoardKind::Bible => (None, None),
        };
        Self {
            columns,
            children,
            clear_completed_disabled: Some(board.clear_completed_disabled),
            index_card_enabled: Some(board.index_card_enabled),
        }
    }
}

/// Task payload.
///
/// Reminder offsets are device-local and have no field here; a remote
/// payload carrying them has the key ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub note: Field<String>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub due: Field<i64>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub completed_at: Field<i64>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub order: Field<i64>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub recurrence: Field<Recurrence>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub streak: Field<u32>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub longest_streak: Field<u32>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub subtasks: Field<Vec<Subtask>>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub images: Field<Vec<String>>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub documents: Field<Vec<Document>>,

    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub bounty: Field<Bounty>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl TaskV1 {
    /// Full-state payload: every removable field is sent, `null` when empty.
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: Some(task.title.clone()),
            note: Field::from_option(task.note.clone()),
            due: Field::from_option(task.due),
            completed_at: Field::from_option(task.completed_at),
            order: Field::from_option(task.order),
            recurrence: Field::from_option(task.recurrence.clone()),
            streak: Field::from_option(task.streak),
            longest_streak: Field::from_option(task.longest_streak),
            subtasks: Field::from_option(task.subtasks.clone()),
            images: Field::from_option(task.images.clone()),
            documents: Field::from_option(task.documents.clone()),
            bounty: Field::from_option(task.bounty.clone()),
            created_by: task.created_by.clone(),
            created_at: Some(task.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_tag_value() {
        for status in [TaskStatus::Open, TaskStatus::Done, TaskStatus::Deleted] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("archived"), None);
    }

    #[test]
    fn full_state_payload_sends_explicit_nulls() {
        let task = Task::with_id("t1", "b1", "Buy milk", 5);
        let json = serde_json::to_value(TaskV1::from_task(&task)).unwrap();
        assert_eq!(json["title"], "Buy milk");
        assert!(json["images"].is_null());
        assert!(json.as_object().unwrap().contains_key("images"));
        assert!(json.get("reminders").is_none());
    }

    #[test]
    fn remote_reminders_are_ignored() {
        let payload: TaskV1 =
            serde_json::from_str(r#"{"title":"x","reminders":[5,10],"order":2}"#).unwrap();
        assert_eq!(payload.order, Field::Set(2));
        assert_eq!(payload.images, Field::Absent);
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(serde_json::from_str::<TaskV1>(r#"{"order":"first"}"#).is_err());
        assert!(serde_json::from_str::<ScopeMetadataV1>(r#"{"columns":"x"}"#).is_err());
    }

    #[test]
    fn compound_metadata_uses_shared_child_ids() {
        let board = Board::new(
            "local-c",
            "All",
            BoardKind::Compound {
                children: vec!["local-a".into()],
            },
        );
        let meta = ScopeMetadataV1::from_board(&board, |id| format!("shared-{}", id));
        assert_eq!(meta.children, Some(vec!["shared-local-a".to_string()]));
        assert_eq!(meta.columns, None);
        assert_eq!(meta.clear_completed_disabled, Some(false));
    }
}
