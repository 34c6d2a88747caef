//! Completion progress over the currently materialized projection.

use crate::types::{DisplayRow, Progress};

/// Compute progress from whichever projection is presently active. Header
/// rows are ignored; only task rows count.
pub fn progress_of(rows: &[DisplayRow]) -> Progress {
    let mut total = 0usize;
    let mut completed = 0usize;
    for row in rows {
        if let DisplayRow::Task(task) = row {
            total += 1;
            if task.completed {
                completed += 1;
            }
        }
    }
    let percentage = if total > 0 {
        (completed * 100 / total) as u8
    } else {
        0
    };
    Progress {
        total,
        completed,
        percentage,
    }
}
