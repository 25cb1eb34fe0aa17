//! Task merge engine.
//!
//! An admitted task event either removes the task (`status=deleted`) or
//! folds the payload into the local record field by field:
//!
//! * a key present with `null` clears the local value,
//! * a missing key leaves the local value alone,
//! * reminder offsets always come from the local record,
//! * the `status` tag decides completion and the `col` tag the column,
//! * the bounty goes through [`merge_bounty`].

use crate::bounty::{merge_bounty, BountyContext};
use crate::models::Task;
use crate::payload::{TaskStatus, TaskV1};

/// Decoded task event.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_id: String,
    /// Local id of the board that owns the scope.
    pub board_id: String,
    pub status: TaskStatus,
    /// `col` tag.
    pub column: Option<String>,
    pub payload: TaskV1,
    /// Public key that signed the event.
    pub actor: String,
    pub event_at: u64,
    /// Entity clock before this event, if any.
    pub previous_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMerge {
    Upserted {
        task: Box<Task>,
        /// A bounty change was refused; the rest of the update applied.
        bounty_denied: bool,
    },
    Removed,
}

pub fn merge_task(local: Option<&Task>, update: TaskUpdate) -> TaskMerge {
    if update.status == TaskStatus::Deleted {
        return TaskMerge::Removed;
    }
    let TaskUpdate {
        task_id,
        board_id,
        status,
        column,
        payload,
        actor,
        event_at,
        previous_at,
    } = update;

    let mut task = match local {
        Some(local) => local.clone(),
        None => {
            let mut fresh = Task::with_id(
                task_id,
                board_id.clone(),
                String::new(),
                payload.created_at.unwrap_or(event_at),
            );
            fresh.created_by = Some(payload.created_by.clone().unwrap_or_else(|| actor.clone()));
            fresh
        }
    };

    task.board_id = board_id;
    if let Some(title) = payload.title {
        task.title = title;
    }
    if let Some(column) = column {
        task.column = Some(column);
    }

    task.note = payload.note.apply(task.note);
    task.due = payload.due.apply(task.due);
    task.order = payload.order.apply(task.order);
    task.recurrence = payload.recurrence.apply(task.recurrence);
    task.streak = payload.streak.apply(task.streak);
    task.longest_streak = payload.longest_streak.apply(task.longest_streak);
    task.subtasks = payload.subtasks.apply(task.subtasks);
    task.images = payload.images.apply(task.images);
    task.documents = payload.documents.apply(task.documents);

    task.completed = status == TaskStatus::Done;
    task.completed_at = if task.completed {
        payload.completed_at.apply(task.completed_at)
    } else {
        None
    };

    let ctx = BountyContext {
        actor: &actor,
        event_at,
        local_seen_at: previous_at.unwrap_or(0),
    };
    let bounty = merge_bounty(task.bounty.as_ref(), payload.bounty, &ctx);
    task.bounty = bounty.bounty;

    TaskMerge::Upserted {
        task: Box::new(task),
        bounty_denied: bounty.denied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;

    fn update(payload: TaskV1) -> TaskUpdate {
        TaskUpdate {
            task_id: "t1".into(),
            board_id: "b1".into(),
            status: TaskStatus::Open,
            column: None,
            payload,
            actor: "alice".into(),
            event_at: 100,
            previous_at: None,
        }
    }

    fn upserted(merge: TaskMerge) -> Task {
        match merge {
            TaskMerge::Upserted { task, .. } => *task,
            TaskMerge::Removed => panic!("expected upsert"),
        }
    }

    #[test]
    fn new_task_from_payload() {
        let payload = TaskV1 {
            title: Some("Buy milk".into()),
            order: Field::Set(0),
            created_at: Some(42),
            ..Default::default()
        };
        let mut incoming = update(payload);
        incoming.column = Some("todo".into());
        let task = upserted(merge_task(None, incoming));
        assert_eq!(task.id, "t1");
        assert_eq!(task.title, "Buy milk");
        assert_eq!(task.order, Some(0));
        assert_eq!(task.column.as_deref(), Some("todo"));
        assert_eq!(task.created_at, 42);
        assert_eq!(task.created_by.as_deref(), Some("alice"));
    }

    #[test]
    fn explicit_null_clears_and_absence_keeps() {
        let mut local = Task::with_id("t1", "b1", "Photo", 1);
        local.images = Some(vec!["data:image/png;base64,AAAA".into()]);
        local.note = Some("keep me".into());

        let cleared = upserted(merge_task(
            Some(&local),
            update(TaskV1 {
                images: Field::Clear,
                ..Default::default()
            }),
        ));
        assert_eq!(cleared.images, None);
        assert_eq!(cleared.note.as_deref(), Some("keep me"));
        assert_eq!(cleared.title, "Photo");

        let untouched = upserted(merge_task(Some(&local), update(TaskV1::default())));
        assert_eq!(untouched.images, local.images);
    }

    #[test]
    fn order_and_streaks_follow_absence_rules() {
        let mut local = Task::with_id("t1", "b1", "Run", 1);
        local.order = Some(3);
        local.streak = Some(4);
        local.longest_streak = Some(9);

        let merged = upserted(merge_task(
            Some(&local),
            update(TaskV1 {
                order: Field::Clear,
                streak: Field::Set(5),
                ..Default::default()
            }),
        ));
        assert_eq!(merged.order, None);
        assert_eq!(merged.streak, Some(5));
        assert_eq!(merged.longest_streak, Some(9));
    }

    #[test]
    fn reminders_stay_local() {
        let mut local = Task::with_id("t1", "b1", "Call", 1);
        local.reminders = Some(vec![15]);
        let payload: TaskV1 = serde_json::from_str(r#"{"reminders":[60]}"#).unwrap();
        let merged = upserted(merge_task(Some(&local), update(payload)));
        assert_eq!(merged.reminders, Some(vec![15]));

        let fresh = upserted(merge_task(None, update(TaskV1::default())));
        assert_eq!(fresh.reminders, None);
    }

    #[test]
    fn status_tag_decides_completion() {
        let mut local = Task::with_id("t1", "b1", "Done?", 1);
        local.completed = true;
        local.completed_at = Some(50);

        let reopened = upserted(merge_task(
            Some(&local),
            update(TaskV1 {
                completed_at: Field::Set(50),
                ..Default::default()
            }),
        ));
        assert!(!reopened.completed);
        assert_eq!(reopened.completed_at, None);

        let mut done = update(TaskV1 {
            completed_at: Field::Set(77),
            ..Default::default()
        });
        done.status = TaskStatus::Done;
        let completed = upserted(merge_task(Some(&reopened), done));
        assert!(completed.completed);
        assert_eq!(completed.completed_at, Some(77));
    }

    #[test]
    fn deleted_status_removes() {
        let local = Task::with_id("t1", "b1", "Gone", 1);
        let mut incoming = update(TaskV1::default());
        incoming.status = TaskStatus::Deleted;
        assert_eq!(merge_task(Some(&local), incoming), TaskMerge::Removed);
    }

    #[test]
    fn created_fields_are_immutable() {
        let mut local = Task::with_id("t1", "b1", "Mine", 10);
        local.created_by = Some("alice".into());
        let merged = upserted(merge_task(
            Some(&local),
            update(TaskV1 {
                created_by: Some("mallory".into()),
                created_at: Some(1),
                ..Default::default()
            }),
        ));
        assert_eq!(merged.created_by.as_deref(), Some("alice"));
        assert_eq!(merged.created_at, 10);
    }
}
