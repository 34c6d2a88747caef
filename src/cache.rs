//! In-memory authoritative projection cache.
//!
//! Keyed arena of tasks plus a per-task subtask index, with a `loaded` gate
//! for lazily fetched subtask lists. Exactly one logical writer (the engine
//! task) mutates it; consumers only ever see immutable snapshots derived
//! from it, so no internal locking is needed.

use std::collections::{HashMap, HashSet};

use crate::types::{SubTask, Task};

#[derive(Debug, Default)]
pub struct ProjectionCache {
    tasks: HashMap<String, Task>,
    subtasks: HashMap<String, Vec<SubTask>>,
    loaded: HashSet<String>,
}

impl ProjectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    // --- reads ---

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Subtasks of a task; empty when not loaded yet.
    pub fn subtasks_of(&self, task_id: &str) -> &[SubTask] {
        self.subtasks.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the subtask list for a task has been materialized.
    pub fn is_loaded(&self, task_id: &str) -> bool {
        self.loaded.contains(task_id)
    }

    pub fn is_expanded(&self, task_id: &str) -> bool {
        self.tasks.get(task_id).is_some_and(|task| task.expanded)
    }

    // --- snapshot application ---

    /// Replace the materialized task set with a query snapshot. Tasks absent
    /// from the snapshot were deleted elsewhere (or left the query) and are
    /// evicted together with their subtask cache, keeping every cached
    /// subtask list attached to a present task.
    pub fn apply_task_snapshot(&mut self, snapshot: Vec<Task>) {
        let keep: HashSet<String> = snapshot.iter().map(|task| task.id.clone()).collect();
        self.tasks.retain(|id, _| keep.contains(id));
        self.subtasks.retain(|id, _| keep.contains(id));
        self.loaded.retain(|id| keep.contains(id));
        for task in snapshot {
            self.tasks.insert(task.id.clone(), task);
        }
    }

    /// Wholesale-replace a task's subtask list (no incremental merge) and
    /// mark it loaded. Snapshots for unknown tasks are dropped.
    pub fn apply_subtask_snapshot(&mut self, task_id: &str, subtasks: Vec<SubTask>) {
        if !self.tasks.contains_key(task_id) {
            return;
        }
        self.subtasks.insert(task_id.to_string(), subtasks);
        self.loaded.insert(task_id.to_string());
    }

    // --- mutations (engine-side optimistic effects) ---

    pub fn upsert_task(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Remove a task and cascade to its cached subtasks.
    pub fn remove_task(&mut self, task_id: &str) -> Option<(Task, Option<Vec<SubTask>>, bool)> {
        let task = self.tasks.remove(task_id)?;
        let subs = self.subtasks.remove(task_id);
        let was_loaded = self.loaded.remove(task_id);
        Some((task, subs, was_loaded))
    }

    pub fn set_task_completion(&mut self, task_id: &str, completed: bool) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.completed = completed;
        }
    }

    /// Cascade-down: force the given subtasks complete alongside the parent.
    pub fn force_subtasks_complete(&mut self, task_id: &str, subtask_ids: &[String]) {
        if let Some(subs) = self.subtasks.get_mut(task_id) {
            for sub in subs.iter_mut() {
                if subtask_ids.contains(&sub.id) {
                    sub.completed = true;
                }
            }
        }
    }

    pub fn set_expanded(&mut self, task_id: &str, expanded: bool) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.expanded = expanded;
        }
    }

    pub fn edit_task(&mut self, task_id: &str, description: String, due_at: Option<i64>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.description = description;
            task.due_at = due_at;
        }
    }

    pub fn set_subtask_completion(&mut self, task_id: &str, subtask_id: &str, completed: bool) {
        if let Some(sub) = self.subtask_mut(task_id, subtask_id) {
            crate::rules::set_subtask_completion(sub, completed);
        }
    }

    pub fn edit_subtask_description(&mut self, task_id: &str, subtask_id: &str, description: String) {
        if let Some(sub) = self.subtask_mut(task_id, subtask_id) {
            sub.description = description;
        }
    }

    pub fn remove_subtask(&mut self, task_id: &str, subtask_id: &str) {
        if let Some(subs) = self.subtasks.get_mut(task_id) {
            subs.retain(|sub| sub.id != subtask_id);
        }
    }

    // --- rollback support ---

    /// Snapshot a task's own fields for a pre-mutation capture. Does not
    /// include the subtask list; rollback granularity is per entity, so a
    /// failed task-field write never reverts the list and vice versa.
    pub fn task_fields_state(&self, task_id: &str) -> TaskFieldsState {
        TaskFieldsState {
            task_id: task_id.to_string(),
            task: self.tasks.get(task_id).cloned(),
        }
    }

    /// Restore previously captured task fields, leaving the subtask list
    /// untouched.
    pub fn restore_task_fields(&mut self, state: TaskFieldsState) {
        match state.task {
            Some(task) => {
                self.tasks.insert(state.task_id, task);
            }
            None => {
                self.tasks.remove(&state.task_id);
            }
        }
    }

    /// Snapshot a task's cached subtask list (and its `loaded` gate).
    pub fn subtask_list_state(&self, task_id: &str) -> SubtaskListState {
        SubtaskListState {
            task_id: task_id.to_string(),
            subtasks: self.subtasks.get(task_id).cloned(),
            loaded: self.loaded.contains(task_id),
        }
    }

    /// Restore a previously captured subtask list, leaving the task's own
    /// fields untouched.
    pub fn restore_subtask_list(&mut self, state: SubtaskListState) {
        let SubtaskListState {
            task_id,
            subtasks,
            loaded,
        } = state;
        match subtasks {
            Some(subs) => {
                self.subtasks.insert(task_id.clone(), subs);
            }
            None => {
                self.subtasks.remove(&task_id);
            }
        }
        if loaded {
            self.loaded.insert(task_id);
        } else {
            self.loaded.remove(&task_id);
        }
    }

    fn subtask_mut(&mut self, task_id: &str, subtask_id: &str) -> Option<&mut SubTask> {
        self.subtasks
            .get_mut(task_id)?
            .iter_mut()
            .find(|sub| sub.id == subtask_id)
    }
}

/// Pre-mutation snapshot of a task's own fields, used for conditional
/// rollback of task-level writes.
#[derive(Debug, Clone)]
pub struct TaskFieldsState {
    pub task_id: String,
    pub task: Option<Task>,
}

/// Pre-mutation snapshot of a task's cached subtask list, used for
/// conditional rollback of subtask-level writes.
#[derive(Debug, Clone)]
pub struct SubtaskListState {
    pub task_id: String,
    pub subtasks: Option<Vec<SubTask>>,
    pub loaded: bool,
}
