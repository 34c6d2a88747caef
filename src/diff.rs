//! Minimal deltas between ordered projections, plus display-list building.
//!
//! Rows are matched by stable key identity (tasks and subtasks by id, date
//! headers by label), so a list view can patch itself instead of redrawing.
//! The same reconciler serves the top-level task list and any nested subtask
//! list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use crate::types::{local_day_of, DisplayRow, SubTask, Task, ViewMode};

/// A row type the reconciler can diff: stable identity plus content equality.
pub trait DiffRow: Clone {
    type Key: Eq + Hash + Clone + std::fmt::Debug;

    fn key(&self) -> Self::Key;

    /// Whether the displayed content is unchanged. Identity fields are not
    /// consulted here; two rows compared this way always share a key.
    fn content_eq(&self, other: &Self) -> bool;
}

/// Key for a display row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Header(String),
    Task(String),
}

impl DiffRow for DisplayRow {
    type Key = RowKey;

    fn key(&self) -> RowKey {
        match self {
            DisplayRow::DateHeader { label } => RowKey::Header(label.clone()),
            DisplayRow::Task(task) => RowKey::Task(task.id.clone()),
        }
    }

    fn content_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DisplayRow::DateHeader { .. }, DisplayRow::DateHeader { .. }) => true,
            (DisplayRow::Task(a), DisplayRow::Task(b)) => {
                a.completed == b.completed && a.description == b.description && a.due_at == b.due_at
            }
            _ => false,
        }
    }
}

impl DiffRow for SubTask {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn content_eq(&self, other: &Self) -> bool {
        self.completed == other.completed && self.description == other.description
    }
}

/// One patch operation. `Remove` and `Move::from` index into the old
/// projection; `Insert`, `Change` and `Move::to` index into the new one.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp<R: DiffRow> {
    Insert { index: usize, row: R },
    Remove { index: usize, key: R::Key },
    Change { index: usize, row: R },
    Move { from: usize, to: usize, key: R::Key },
}

/// Compute the minimal keyed delta turning `old` into `new`.
///
/// Ops are emitted removes first (descending by old index), then moves, then
/// inserts (ascending), then content changes. Rows that merely shift because
/// of surrounding inserts or removes produce no op of their own; a `Move` is
/// only emitted for rows that change relative order among the survivors.
pub fn reconcile<R: DiffRow>(old: &[R], new: &[R]) -> Vec<RowOp<R>> {
    let old_pos: HashMap<R::Key, usize> = old
        .iter()
        .enumerate()
        .map(|(i, row)| (row.key(), i))
        .collect();
    let new_pos: HashMap<R::Key, usize> = new
        .iter()
        .enumerate()
        .map(|(i, row)| (row.key(), i))
        .collect();

    let mut ops = Vec::new();

    // Removes, from the bottom up so earlier indices stay valid.
    for (index, row) in old.iter().enumerate().rev() {
        if !new_pos.contains_key(&row.key()) {
            ops.push(RowOp::Remove {
                index,
                key: row.key(),
            });
        }
    }

    // Moves: survivors whose old ranks fall outside the longest increasing
    // run changed relative order.
    let survivors: Vec<(&R, usize)> = new
        .iter()
        .filter_map(|row| old_pos.get(&row.key()).map(|&i| (row, i)))
        .collect();
    let old_ranks: Vec<usize> = survivors.iter().map(|&(_, i)| i).collect();
    let stable = longest_increasing_run(&old_ranks);
    for (seq_idx, &(row, old_index)) in survivors.iter().enumerate() {
        if !stable.contains(&seq_idx) {
            ops.push(RowOp::Move {
                from: old_index,
                to: new_pos[&row.key()],
                key: row.key(),
            });
        }
    }

    // Inserts.
    for (index, row) in new.iter().enumerate() {
        if !old_pos.contains_key(&row.key()) {
            ops.push(RowOp::Insert {
                index,
                row: row.clone(),
            });
        }
    }

    // Content changes.
    for (index, row) in new.iter().enumerate() {
        if let Some(&old_index) = old_pos.get(&row.key()) {
            if !row.content_eq(&old[old_index]) {
                ops.push(RowOp::Change {
                    index,
                    row: row.clone(),
                });
            }
        }
    }

    ops
}

/// Indices (into `seq`) of one longest strictly-increasing subsequence.
fn longest_increasing_run(seq: &[usize]) -> HashSet<usize> {
    if seq.is_empty() {
        return HashSet::new();
    }
    // tails[k] = index into seq of the smallest tail of an increasing
    // subsequence of length k+1; prev links reconstruct the chosen run.
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let slot = tails.partition_point(|&t| seq[t] < value);
        if slot > 0 {
            prev[i] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(i);
        } else {
            tails[slot] = i;
        }
    }
    let mut run = HashSet::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        run.insert(i);
        cursor = prev[i];
    }
    run
}

/// Ascending due order; undated tasks last, ties broken by id so the order
/// is stable across snapshots.
pub fn sort_tasks_for_display(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| match (a.due_at, b.due_at) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}

/// Build the display projection for a view mode.
///
/// Single-day mode is a flat list of that day's tasks, no headers; undated
/// tasks never appear there. Grouped mode emits one header per distinct
/// local calendar day in ascending order, each followed by that day's tasks,
/// with an undated bucket ordered last.
pub fn build_display_rows(
    tasks: &[Task],
    mode: &ViewMode,
    header_format: &str,
    undated_label: &str,
) -> Vec<DisplayRow> {
    let mut sorted: Vec<Task> = tasks.to_vec();
    sort_tasks_for_display(&mut sorted);

    match mode {
        ViewMode::Day(day) => sorted
            .into_iter()
            .filter(|task| task.due_at.is_some_and(|ts| local_day_of(ts) == *day))
            .map(DisplayRow::Task)
            .collect(),
        ViewMode::AllGrouped => {
            let mut dated: BTreeMap<chrono::NaiveDate, Vec<Task>> = BTreeMap::new();
            let mut undated: Vec<Task> = Vec::new();
            for task in sorted {
                match task.due_at {
                    Some(ts) => dated.entry(local_day_of(ts)).or_default().push(task),
                    None => undated.push(task),
                }
            }
            let mut rows = Vec::new();
            for (day, tasks) in dated {
                rows.push(DisplayRow::DateHeader {
                    label: day.format(header_format).to_string(),
                });
                rows.extend(tasks.into_iter().map(DisplayRow::Task));
            }
            if !undated.is_empty() {
                rows.push(DisplayRow::DateHeader {
                    label: undated_label.to_string(),
                });
                rows.extend(undated.into_iter().map(DisplayRow::Task));
            }
            rows
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn task(id: &str, due_at: Option<i64>, completed: bool) -> Task {
        Task {
            id: id.to_string(),
            owner_id: "u1".to_string(),
            description: format!("task {id}"),
            due_at,
            completed,
            expanded: false,
            reminder_at: None,
        }
    }

    fn rows(tasks: &[Task]) -> Vec<DisplayRow> {
        tasks.iter().cloned().map(DisplayRow::Task).collect()
    }

    fn day_ms(year: i32, month: u32, day: u32, hour: u32) -> i64 {
        let date = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        let (start, _) = crate::types::local_day_bounds(date);
        start + (hour as i64) * 3_600_000
    }

    #[test]
    fn identical_projections_produce_no_ops() {
        let a = rows(&[task("a", Some(1), false), task("b", Some(2), false)]);
        assert!(reconcile(&a, &a).is_empty());
    }

    #[test]
    fn single_flag_flip_is_exactly_one_change() {
        let old = rows(&[task("a", Some(1), false), task("b", Some(2), false)]);
        let new = rows(&[task("a", Some(1), false), task("b", Some(2), true)]);
        let ops = reconcile(&old, &new);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            RowOp::Change { index, row } => {
                assert_eq!(*index, 1);
                assert_eq!(row.as_task().unwrap().id, "b");
            }
            other => panic!("expected Change, got {other:?}"),
        }
    }

    #[test]
    fn appearing_row_is_an_insert() {
        let old = rows(&[task("a", Some(1), false)]);
        let new = rows(&[task("a", Some(1), false), task("b", Some(2), false)]);
        let ops = reconcile(&old, &new);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], RowOp::Insert { index: 1, .. }));
    }

    #[test]
    fn disappearing_row_is_a_remove() {
        let old = rows(&[task("a", Some(1), false), task("b", Some(2), false)]);
        let new = rows(&[task("b", Some(2), false)]);
        let ops = reconcile(&old, &new);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            RowOp::Remove { index, key } => {
                assert_eq!(*index, 0);
                assert_eq!(*key, RowKey::Task("a".to_string()));
            }
            other => panic!("expected Remove, got {other:?}"),
        }
    }

    #[test]
    fn reorder_is_a_single_move() {
        let old = rows(&[
            task("a", Some(1), false),
            task("b", Some(2), false),
            task("c", Some(3), false),
        ]);
        // "a" jumps to the back; "b" and "c" keep relative order.
        let new = rows(&[
            task("b", Some(2), false),
            task("c", Some(3), false),
            task("a", Some(9), false),
        ]);
        let ops = reconcile(&old, &new);
        let moves: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, RowOp::Move { .. }))
            .collect();
        assert_eq!(moves.len(), 1);
        match moves[0] {
            RowOp::Move { from, to, key } => {
                assert_eq!((*from, *to), (0, 2));
                assert_eq!(*key, RowKey::Task("a".to_string()));
            }
            _ => unreachable!(),
        }
        // The due-date edit also surfaces as a change on the moved row.
        assert!(ops
            .iter()
            .any(|op| matches!(op, RowOp::Change { index: 2, .. })));
    }

    #[test]
    fn subtask_lists_reconcile_by_id() {
        let old = vec![
            SubTask {
                id: "s1".to_string(),
                parent_task_id: "t1".to_string(),
                description: "one".to_string(),
                completed: false,
            },
            SubTask {
                id: "s2".to_string(),
                parent_task_id: "t1".to_string(),
                description: "two".to_string(),
                completed: false,
            },
        ];
        let mut new = old.clone();
        new[0].completed = true;
        new.remove(1);
        let ops = reconcile(&old, &new);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], RowOp::Remove { index: 1, .. }));
        assert!(matches!(&ops[1], RowOp::Change { index: 0, .. }));
    }

    #[test]
    fn grouped_view_emits_header_per_day_ascending() {
        let monday = day_ms(2025, 3, 10, 9);
        let tuesday = day_ms(2025, 3, 11, 14);
        let tasks = vec![
            task("late", Some(tuesday), false),
            task("early", Some(monday), false),
            task("second", Some(monday + 3_600_000), true),
        ];
        let rows = build_display_rows(&tasks, &ViewMode::AllGrouped, "%A, %d %B", "Undated");
        assert_eq!(rows.len(), 5);
        assert!(matches!(&rows[0], DisplayRow::DateHeader { .. }));
        assert_eq!(rows[1].as_task().unwrap().id, "early");
        assert_eq!(rows[2].as_task().unwrap().id, "second");
        assert!(matches!(&rows[3], DisplayRow::DateHeader { .. }));
        assert_eq!(rows[4].as_task().unwrap().id, "late");
        let header_count = rows
            .iter()
            .filter(|row| matches!(row, DisplayRow::DateHeader { .. }))
            .count();
        assert_eq!(header_count, 2);
    }

    #[test]
    fn grouped_view_buckets_undated_last() {
        let monday = day_ms(2025, 3, 10, 9);
        let tasks = vec![task("floating", None, false), task("dated", Some(monday), false)];
        let rows = build_display_rows(&tasks, &ViewMode::AllGrouped, "%A, %d %B", "Undated");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1].as_task().unwrap().id, "dated");
        assert_eq!(
            rows[2],
            DisplayRow::DateHeader {
                label: "Undated".to_string()
            }
        );
        assert_eq!(rows[3].as_task().unwrap().id, "floating");
    }

    #[test]
    fn day_view_is_flat_and_drops_undated() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let in_day = day_ms(2025, 3, 10, 8);
        let other_day = day_ms(2025, 3, 12, 8);
        let tasks = vec![
            task("yes", Some(in_day), false),
            task("no", Some(other_day), false),
            task("undated", None, false),
        ];
        let rows = build_display_rows(&tasks, &ViewMode::Day(date), "%A, %d %B", "Undated");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_task().unwrap().id, "yes");
    }

    #[test]
    fn display_sort_orders_by_due_then_id() {
        let mut tasks = vec![
            task("c", None, false),
            task("b", Some(5), false),
            task("a", Some(5), false),
            task("d", Some(1), false),
        ];
        sort_tasks_for_display(&mut tasks);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }
}
