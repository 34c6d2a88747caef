//! Core data model: tasks, subtasks, display rows, queries.

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

/// A top-level user-owned to-do item.
///
/// `id` is opaque and assigned by the remote store; it is carried next to the
/// document fields rather than inside them, so it is excluded from the field
/// (de)serialization and filled in from the document key after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(skip)]
    pub id: String,
    pub owner_id: String,
    pub description: String,
    /// Due timestamp in epoch milliseconds; `None` means undated.
    pub due_at: Option<i64>,
    #[serde(default)]
    pub completed: bool,
    /// UI flag: whether the subtask list is unfolded. Persisted so it
    /// survives reloads.
    #[serde(default)]
    pub expanded: bool,
    /// Reminder timestamp in epoch milliseconds, if any.
    #[serde(default)]
    pub reminder_at: Option<i64>,
}

/// A child item strictly owned by a [`Task`]. Deleting the parent deletes all
/// of its subtasks atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub parent_task_id: String,
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

/// One row of the display-ready projection: either a calendar-day header or
/// a task. A tagged variant instead of runtime type inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DisplayRow {
    DateHeader { label: String },
    Task(Task),
}

impl DisplayRow {
    pub fn as_task(&self) -> Option<&Task> {
        match self {
            DisplayRow::Task(task) => Some(task),
            DisplayRow::DateHeader { .. } => None,
        }
    }
}

/// Which projection the consumer is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewMode {
    /// Flat list of the tasks due on one local calendar day. No headers,
    /// and undated tasks are simply absent.
    Day(NaiveDate),
    /// All tasks grouped under ascending date headers, with undated tasks
    /// in a trailing bucket.
    AllGrouped,
}

/// A query against the remote store. Selects either all tasks for an owner
/// or the tasks for an owner whose due time falls in a day range, ascending
/// by due time in both cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskQuery {
    ForOwner {
        owner_id: String,
    },
    ForOwnerOnDay {
        owner_id: String,
        start_ms: i64,
        end_ms: i64,
    },
}

impl TaskQuery {
    /// Build the query backing a view mode for the given owner.
    pub fn for_view(owner_id: &str, mode: &ViewMode) -> Self {
        match mode {
            ViewMode::AllGrouped => TaskQuery::ForOwner {
                owner_id: owner_id.to_string(),
            },
            ViewMode::Day(day) => {
                let (start_ms, end_ms) = local_day_bounds(*day);
                TaskQuery::ForOwnerOnDay {
                    owner_id: owner_id.to_string(),
                    start_ms,
                    end_ms,
                }
            }
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            TaskQuery::ForOwner { owner_id } => owner_id,
            TaskQuery::ForOwnerOnDay { owner_id, .. } => owner_id,
        }
    }
}

/// Aggregate completion figures for the currently materialized task set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub percentage: u8,
}

/// Reminder lead time relative to the due time. Mirrors the fixed options
/// offered when adding a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderOffset {
    #[default]
    None,
    AtDueTime,
    Minutes15,
    Minutes30,
    Hour1,
    Day1,
}

impl ReminderOffset {
    /// Offset in minutes before the due time, or `None` for no reminder.
    pub fn minutes_before(self) -> Option<i64> {
        match self {
            ReminderOffset::None => None,
            ReminderOffset::AtDueTime => Some(0),
            ReminderOffset::Minutes15 => Some(15),
            ReminderOffset::Minutes30 => Some(30),
            ReminderOffset::Hour1 => Some(60),
            ReminderOffset::Day1 => Some(24 * 60),
        }
    }

    /// Derive the reminder timestamp for a due time, if both are present.
    pub fn reminder_at(self, due_at: Option<i64>) -> Option<i64> {
        let due = due_at?;
        let minutes = self.minutes_before()?;
        Some(due - minutes * 60_000)
    }
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub description: String,
    pub due_at: Option<i64>,
    pub reminder: ReminderOffset,
}

/// Field-level edit of an existing task.
#[derive(Debug, Clone)]
pub struct TaskEdit {
    pub description: String,
    pub due_at: Option<i64>,
}

/// Current timestamp in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Start and end of a local calendar day as epoch milliseconds, inclusive on
/// both ends (23:59:59.999, matching the original day-range query).
pub fn local_day_bounds(day: NaiveDate) -> (i64, i64) {
    let start = day.and_hms_opt(0, 0, 0).expect("valid midnight");
    let end = day.and_hms_milli_opt(23, 59, 59, 999).expect("valid end of day");
    (local_ts_millis(start), local_ts_millis(end))
}

/// The local calendar day a timestamp falls on.
pub fn local_day_of(ts_ms: i64) -> NaiveDate {
    let utc = DateTime::from_timestamp_millis(ts_ms).unwrap_or_default();
    utc.with_timezone(&Local).date_naive()
}

fn local_ts_millis(naive: chrono::NaiveDateTime) -> i64 {
    // On DST gaps/overlaps, take the earliest valid interpretation.
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.timestamp_millis(),
        chrono::LocalResult::Ambiguous(a, _) => a.timestamp_millis(),
        chrono::LocalResult::None => Local
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_bounds_cover_whole_day() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let (start, end) = local_day_bounds(day);
        assert!(start < end);
        assert_eq!(end - start, 24 * 3600 * 1000 - 1);
        assert_eq!(local_day_of(start), day);
        assert_eq!(local_day_of(end), day);
    }

    #[test]
    fn reminder_offsets_subtract_from_due_time() {
        let due = Some(1_000_000_000_i64);
        assert_eq!(ReminderOffset::None.reminder_at(due), None);
        assert_eq!(ReminderOffset::AtDueTime.reminder_at(due), due);
        assert_eq!(
            ReminderOffset::Minutes15.reminder_at(due),
            Some(1_000_000_000 - 15 * 60_000)
        );
        assert_eq!(
            ReminderOffset::Day1.reminder_at(due),
            Some(1_000_000_000 - 1440 * 60_000)
        );
        assert_eq!(ReminderOffset::Hour1.reminder_at(None), None);
    }

    #[test]
    fn task_fields_roundtrip_without_id() {
        let task = Task {
            id: "t1".to_string(),
            owner_id: "u1".to_string(),
            description: "water plants".to_string(),
            due_at: Some(1234),
            completed: false,
            expanded: true,
            reminder_at: None,
        };
        let fields = serde_json::to_value(&task).unwrap();
        assert!(fields.get("id").is_none());
        let mut back: Task = serde_json::from_value(fields).unwrap();
        back.id = task.id.clone();
        assert_eq!(back, task);
    }
}
