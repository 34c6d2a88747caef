//! Completion rules between a task and its subtasks.
//!
//! The invariant is enforced at mutation time only: marking a task complete
//! requires every subtask to be complete (or there to be none). It is not
//! re-checked against later independent subtask edits, and completing the
//! last subtask never auto-completes the parent (no cascade-up).

use crate::error::SyncError;
use crate::types::{SubTask, Task};

/// The atomic write produced by an allowed completion change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEffects {
    /// New value for `task.completed`.
    pub completed: bool,
    /// Subtasks to force-complete in the same atomic write. Normally empty,
    /// since the precondition already requires all of them complete.
    pub force_complete: Vec<String>,
}

/// Decide whether `task.completed` may change to `desired`, and what the
/// resulting atomic write is.
///
/// Un-completing is always allowed. Completing requires every subtask to be
/// complete; otherwise `IncompleteSubtasks` is returned and nothing changes.
pub fn set_task_completion(
    task: &Task,
    desired: bool,
    subtasks: &[SubTask],
) -> Result<CompletionEffects, SyncError> {
    if !desired {
        return Ok(CompletionEffects {
            completed: false,
            force_complete: Vec::new(),
        });
    }

    if !subtasks.iter().all(|sub| sub.completed) {
        return Err(SyncError::IncompleteSubtasks {
            task_id: task.id.clone(),
        });
    }

    let force_complete = subtasks
        .iter()
        .filter(|sub| !sub.completed)
        .map(|sub| sub.id.clone())
        .collect();

    Ok(CompletionEffects {
        completed: true,
        force_complete,
    })
}

/// Toggle a subtask's completion. Unconditional, and never touches the
/// parent task's `completed` field.
pub fn set_subtask_completion(subtask: &mut SubTask, desired: bool) {
    subtask.completed = desired;
}
