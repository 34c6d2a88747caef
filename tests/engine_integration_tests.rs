//! Integration tests for the engine over the in-memory realtime store.
//!
//! Each test spins up an engine against a `MemoryStore`, drives it through
//! the public handle, and observes the published projection and the event
//! stream.

use std::sync::Arc;
use std::time::Duration;

use daytask_sync::{
    DisplayRow, EngineConfig, EngineEvent, EngineEvents, MemoryStore, ReminderOffset, RemoteStore,
    SyncError, Task, TaskDraft, TaskEdit, TaskEngine, TaskEngineHandle, ViewMode,
};
use serde_json::json;

fn task_fields(owner: &str, description: &str, due_at: Option<i64>) -> serde_json::Value {
    json!({
        "owner_id": owner,
        "description": description,
        "due_at": due_at,
        "completed": false,
        "expanded": false,
        "reminder_at": null,
    })
}

fn draft(description: &str, due_at: Option<i64>) -> TaskDraft {
    TaskDraft {
        description: description.to_string(),
        due_at,
        reminder: ReminderOffset::None,
    }
}

fn setup_engine(store: Arc<MemoryStore>) -> (TaskEngineHandle, EngineEvents) {
    TaskEngine::spawn(store, EngineConfig::for_owner("u1"))
}

/// Poll the projection until a condition holds.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Drain events until one matches, with a timeout.
async fn next_matching(
    events: &mut EngineEvents,
    what: &str,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for event: {what}"))
}

/// Task rows of the current projection, skipping date headers (the default
/// grouped view puts a header before every task).
fn task_rows(engine: &TaskEngineHandle) -> Vec<Task> {
    engine
        .display_rows()
        .iter()
        .filter_map(|row| row.as_task().cloned())
        .collect()
}

mod task_tests {
    use super::*;

    #[tokio::test]
    async fn add_task_projects_exactly_one_row() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _events) = setup_engine(store);

        engine
            .add_task(draft("water plants", Some(100)))
            .outcome()
            .await
            .unwrap();
        wait_until("task row appears", || task_rows(&engine).len() == 1).await;

        let tasks = task_rows(&engine);
        assert_eq!(tasks[0].description, "water plants");
        assert_eq!(tasks[0].due_at, Some(100));
        assert!(!tasks[0].completed);
    }

    #[tokio::test]
    async fn empty_description_is_rejected_without_effect() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _events) = setup_engine(store);

        let err = engine.add_task(draft("   ", None)).outcome().await.unwrap_err();
        assert_eq!(err, SyncError::EmptyDescription);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.display_rows().is_empty());
    }

    #[tokio::test]
    async fn reminder_offset_derives_reminder_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _events) = setup_engine(store.clone());

        engine
            .add_task(TaskDraft {
                description: "call dentist".to_string(),
                due_at: Some(1_000_000),
                reminder: ReminderOffset::Minutes15,
            })
            .outcome()
            .await
            .unwrap();
        wait_until("task row appears", || task_rows(&engine).len() == 1).await;

        assert_eq!(
            task_rows(&engine)[0].reminder_at,
            Some(1_000_000 - 15 * 60_000)
        );
    }

    #[tokio::test]
    async fn edit_task_is_optimistic_then_confirmed() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "old name", Some(5)));
        let (engine, _events) = setup_engine(store);
        wait_until("seeded row appears", || task_rows(&engine).len() == 1).await;
        let id = task_rows(&engine)[0].id.clone();

        engine
            .edit_task(
                &id,
                TaskEdit {
                    description: "new name".to_string(),
                    due_at: Some(7),
                },
            )
            .outcome()
            .await
            .unwrap();
        wait_until("edit lands", || {
            task_rows(&engine)
                .first()
                .is_some_and(|t| t.description == "new name" && t.due_at == Some(7))
        })
        .await;
    }

    #[tokio::test]
    async fn deleting_unknown_task_reports_not_found() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _events) = setup_engine(store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = engine.delete_task("ghost").outcome().await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn external_deletion_evicts_the_row() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("seeded row appears", || task_rows(&engine).len() == 1).await;

        store.external_delete_task(&id);
        wait_until("row evicted", || engine.display_rows().is_empty()).await;
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "good", Some(1)));
        store.seed_task(json!({ "owner_id": "u1", "description": 42 }));
        let (engine, _events) = setup_engine(store);

        wait_until("good row appears", || task_rows(&engine).len() == 1).await;
        assert_eq!(task_rows(&engine)[0].description, "good");
    }
}

mod completion_tests {
    use super::*;

    #[tokio::test]
    async fn completing_with_incomplete_subtasks_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        store.seed_subtask(&id, json!({ "description": "sub", "completed": false }));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        // The subtask list is not loaded; the engine fetches it before
        // deciding.
        let err = engine
            .toggle_task_completion(&id, true)
            .outcome()
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::IncompleteSubtasks {
                task_id: id.clone()
            }
        );
        assert!(!task_rows(&engine)[0].completed);
    }

    #[tokio::test]
    async fn completing_after_all_subtasks_done_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let sub = store.seed_subtask(&id, json!({ "description": "sub", "completed": false }));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        engine.load_subtasks(&id).await.unwrap();
        wait_until("subtasks load", || engine.subtasks_of(&id).len() == 1).await;

        engine
            .toggle_subtask_completion(&id, &sub, true)
            .outcome()
            .await
            .unwrap();
        engine
            .toggle_task_completion(&id, true)
            .outcome()
            .await
            .unwrap();
        wait_until("task completes", || {
            task_rows(&engine).first().is_some_and(|t| t.completed)
        })
        .await;
    }

    #[tokio::test]
    async fn uncompleting_is_always_allowed() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(json!({
            "owner_id": "u1",
            "description": "done already",
            "due_at": null,
            "completed": true,
        }));
        store.seed_subtask(&id, json!({ "description": "sub", "completed": false }));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        engine
            .toggle_task_completion(&id, false)
            .outcome()
            .await
            .unwrap();
        wait_until("task uncompleted", || {
            task_rows(&engine).first().is_some_and(|t| !t.completed)
        })
        .await;
    }

    #[tokio::test]
    async fn completing_last_subtask_never_cascades_up() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let sub = store.seed_subtask(&id, json!({ "description": "only", "completed": false }));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        engine.load_subtasks(&id).await.unwrap();
        wait_until("subtasks load", || engine.subtasks_of(&id).len() == 1).await;

        engine
            .toggle_subtask_completion(&id, &sub, true)
            .outcome()
            .await
            .unwrap();
        wait_until("subtask completes", || engine.subtasks_of(&id)[0].completed).await;
        assert!(!task_rows(&engine)[0].completed);
    }

    #[tokio::test]
    async fn progress_floors_percentage() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(json!({ "owner_id": "u1", "description": "a", "due_at": 1, "completed": true }));
        store.seed_task(task_fields("u1", "b", Some(2)));
        store.seed_task(task_fields("u1", "c", Some(3)));
        let (engine, _events) = setup_engine(store);
        wait_until("all rows appear", || engine.progress().total == 3).await;

        let progress = engine.progress();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.percentage, 33);
    }
}

mod subtask_tests {
    use super::*;

    #[tokio::test]
    async fn subtasks_are_lazy_until_loaded() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        store.seed_subtask(&id, json!({ "description": "sub", "completed": false }));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        assert!(engine.subtasks_of(&id).is_empty());
        engine.load_subtasks(&id).await.unwrap();
        wait_until("subtasks load", || engine.subtasks_of(&id).len() == 1).await;
        assert_eq!(engine.subtasks_of(&id)[0].description, "sub");
    }

    #[tokio::test]
    async fn first_subtask_add_auto_expands_the_task() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        assert!(!task_rows(&engine)[0].expanded);

        engine.add_subtask(&id, "first").outcome().await.unwrap();
        wait_until("subtask arrives", || engine.subtasks_of(&id).len() == 1).await;
        wait_until("task expands", || {
            task_rows(&engine).first().is_some_and(|t| t.expanded)
        })
        .await;
    }

    #[tokio::test]
    async fn subtask_events_carry_keyed_deltas() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let (engine, mut events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        engine.add_subtask(&id, "one").outcome().await.unwrap();
        let event = next_matching(&mut events, "SubtasksChanged", |e| {
            matches!(e, EngineEvent::SubtasksChanged { .. })
        })
        .await;
        match event {
            EngineEvent::SubtasksChanged { task_id, ops } => {
                assert_eq!(task_id, id);
                assert!(!ops.is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn delete_and_edit_subtask_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let s1 = store.seed_subtask(&id, json!({ "description": "keep", "completed": false }));
        let s2 = store.seed_subtask(&id, json!({ "description": "drop", "completed": false }));
        let (engine, _events) = setup_engine(store);
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        engine.load_subtasks(&id).await.unwrap();
        wait_until("subtasks load", || engine.subtasks_of(&id).len() == 2).await;

        engine
            .edit_subtask_description(&id, &s1, "kept and renamed")
            .outcome()
            .await
            .unwrap();
        engine.delete_subtask(&id, &s2).outcome().await.unwrap();
        wait_until("one subtask remains", || engine.subtasks_of(&id).len() == 1).await;
        assert_eq!(engine.subtasks_of(&id)[0].description, "kept and renamed");
    }

    #[tokio::test]
    async fn subtask_of_deleted_task_is_gone_with_it() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        store.seed_subtask(&id, json!({ "description": "sub", "completed": false }));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        engine.load_subtasks(&id).await.unwrap();
        wait_until("subtasks load", || engine.subtasks_of(&id).len() == 1).await;

        engine.delete_task(&id).outcome().await.unwrap();
        wait_until("row removed", || engine.display_rows().is_empty()).await;
        assert!(engine.subtasks_of(&id).is_empty());
        let remote = store.fetch_subtasks(&id).await.unwrap();
        assert!(remote.docs.is_empty());
    }
}

mod view_tests {
    use super::*;
    use chrono::NaiveDate;
    use daytask_sync::types::local_day_bounds;

    fn day_ms(year: i32, month: u32, day: u32, hour: u32) -> i64 {
        let date = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        let (start, _) = local_day_bounds(date);
        start + (hour as i64) * 3_600_000
    }

    #[tokio::test]
    async fn grouped_view_has_headers_and_undated_bucket() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "monday", Some(day_ms(2025, 3, 10, 9))));
        store.seed_task(task_fields("u1", "tuesday", Some(day_ms(2025, 3, 11, 9))));
        store.seed_task(task_fields("u1", "floating", None));
        let (engine, _events) = setup_engine(store);
        wait_until("all rows appear", || engine.progress().total == 3).await;

        let rows = engine.display_rows();
        let headers: Vec<String> = rows
            .iter()
            .filter_map(|row| match row {
                DisplayRow::DateHeader { label } => Some(label.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.last().unwrap(), "Undated");
        // Undated bucket is last: the final task row follows the last header.
        assert_eq!(
            rows.last().unwrap().as_task().unwrap().description,
            "floating"
        );
    }

    #[tokio::test]
    async fn day_view_is_flat_and_filtered() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "in range", Some(day_ms(2025, 3, 10, 9))));
        store.seed_task(task_fields("u1", "other day", Some(day_ms(2025, 3, 12, 9))));
        store.seed_task(task_fields("u1", "floating", None));
        let (engine, _events) = setup_engine(store);
        wait_until("grouped rows appear", || engine.progress().total == 3).await;

        engine
            .set_view(ViewMode::Day(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()))
            .await
            .unwrap();
        wait_until("day view settles", || engine.progress().total == 1).await;

        // The day view has no headers at all.
        let rows = engine.display_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_task().unwrap().description, "in range");
    }

    #[tokio::test]
    async fn switching_back_to_grouped_restores_all_tasks() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "a", Some(day_ms(2025, 3, 10, 9))));
        store.seed_task(task_fields("u1", "b", Some(day_ms(2025, 3, 12, 9))));
        let (engine, _events) = setup_engine(store);
        wait_until("rows appear", || engine.progress().total == 2).await;

        engine
            .set_view(ViewMode::Day(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()))
            .await
            .unwrap();
        wait_until("day view settles", || engine.progress().total == 1).await;
        engine.set_view(ViewMode::AllGrouped).await.unwrap();
        wait_until("grouped view restored", || engine.progress().total == 2).await;
    }
}

mod rollback_tests {
    use super::*;

    #[tokio::test]
    async fn failed_edit_rolls_back_and_reports_conflict() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "original", Some(5)));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        let id = task_rows(&engine)[0].id.clone();

        store.fail_next_writes(1);
        let err = engine
            .edit_task(
                &id,
                TaskEdit {
                    description: "doomed".to_string(),
                    due_at: Some(5),
                },
            )
            .outcome()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::WriteConflict { .. }));
        assert_eq!(task_rows(&engine)[0].description, "original");
    }

    #[tokio::test]
    async fn failed_completion_toggle_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        engine.load_subtasks(&id).await.unwrap();
        wait_until("empty list loads", || {
            engine.snapshot().subtasks.contains_key(&id)
        })
        .await;

        store.fail_next_writes(1);
        let err = engine
            .toggle_task_completion(&id, true)
            .outcome()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::WriteConflict { .. }));
        assert!(!task_rows(&engine)[0].completed);
    }

    #[tokio::test]
    async fn failed_task_edit_never_reverts_confirmed_subtask_state() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let sub = store.seed_subtask(&id, json!({ "description": "sub", "completed": false }));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        // Materialize the subtask list without a live subscription: the
        // rejected completion toggle fetches it once.
        let err = engine
            .toggle_task_completion(&id, true)
            .outcome()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::IncompleteSubtasks { .. }));
        wait_until("list materializes", || engine.subtasks_of(&id).len() == 1).await;

        // A task edit fails remotely while a subtask toggle succeeds. The
        // edit's rollback is scoped to task fields and must not revert the
        // newer, confirmed subtask mutation.
        store.fail_next_writes(1);
        let edit = engine.edit_task(
            &id,
            TaskEdit {
                description: "doomed".to_string(),
                due_at: None,
            },
        );
        engine
            .toggle_subtask_completion(&id, &sub, true)
            .outcome()
            .await
            .unwrap();
        let err = edit.outcome().await.unwrap_err();
        assert!(matches!(err, SyncError::WriteConflict { .. }));

        assert!(engine.subtasks_of(&id)[0].completed);
        wait_until("description restored", || {
            task_rows(&engine)
                .first()
                .is_some_and(|t| t.description == "task")
        })
        .await;
    }

    #[tokio::test]
    async fn write_against_externally_deleted_task_reconciles_by_removal() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "task", None));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        store.external_delete_task(&id);
        let err = engine
            .edit_task(
                &id,
                TaskEdit {
                    description: "too late".to_string(),
                    due_at: None,
                },
            )
            .outcome()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
        wait_until("row reconciled away", || engine.display_rows().is_empty()).await;
    }

    #[tokio::test]
    async fn failed_delete_reinstates_the_row() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "task", None));
        let (engine, _events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;
        let id = task_rows(&engine)[0].id.clone();

        store.fail_next_writes(1);
        let err = engine.delete_task(&id).outcome().await.unwrap_err();
        assert!(matches!(err, SyncError::WriteConflict { .. }));
        assert_eq!(task_rows(&engine).len(), 1);
    }
}

mod connectivity_tests {
    use super::*;

    #[tokio::test]
    async fn cached_snapshots_flip_the_offline_flag() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "task", None));
        let (engine, mut events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        store.set_offline(true);
        store.seed_task(task_fields("u1", "while offline", None));
        let event = next_matching(&mut events, "offline", |e| {
            matches!(e, EngineEvent::Connectivity { offline: true })
        })
        .await;
        assert!(matches!(event, EngineEvent::Connectivity { offline: true }));

        store.set_offline(false);
        store.seed_task(task_fields("u1", "back online", None));
        next_matching(&mut events, "online again", |e| {
            matches!(e, EngineEvent::Connectivity { offline: false })
        })
        .await;
    }

    #[tokio::test]
    async fn transport_errors_keep_last_known_rows() {
        let store = Arc::new(MemoryStore::new());
        store.seed_task(task_fields("u1", "task", None));
        let (engine, mut events) = setup_engine(store.clone());
        wait_until("row appears", || task_rows(&engine).len() == 1).await;

        store.push_transport_error();
        next_matching(&mut events, "offline", |e| {
            matches!(e, EngineEvent::Connectivity { offline: true })
        })
        .await;
        assert_eq!(task_rows(&engine).len(), 1);
    }

    #[tokio::test]
    async fn shutdown_resolves_pending_tickets_as_stopped() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _events) = setup_engine(store);
        engine.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = engine.add_task(draft("late", None)).outcome().await.unwrap_err();
        assert_eq!(err, SyncError::EngineStopped);
    }
}

mod event_tests {
    use super::*;
    use daytask_sync::RowOp;

    #[tokio::test]
    async fn completion_flip_emits_a_change_not_a_redraw() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "a", Some(1)));
        store.seed_task(task_fields("u1", "b", Some(2)));
        let (engine, mut events) = setup_engine(store);
        wait_until("rows appear", || engine.progress().total == 2).await;
        // Drain startup events.
        while events.try_recv().is_ok() {}

        engine
            .toggle_task_completion(&id, true)
            .outcome()
            .await
            .unwrap();
        let event = next_matching(&mut events, "RowsChanged", |e| {
            matches!(e, EngineEvent::RowsChanged { .. })
        })
        .await;
        match event {
            EngineEvent::RowsChanged { ops } => {
                assert_eq!(ops.len(), 1);
                assert!(matches!(&ops[0], RowOp::Change { .. }));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn progress_changes_are_announced() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_task(task_fields("u1", "a", None));
        let (engine, mut events) = setup_engine(store);
        wait_until("row appears", || engine.progress().total == 1).await;

        engine
            .toggle_task_completion(&id, true)
            .outcome()
            .await
            .unwrap();
        let event = next_matching(&mut events, "ProgressChanged to 100", |e| {
            matches!(
                e,
                EngineEvent::ProgressChanged { progress } if progress.percentage == 100
            )
        })
        .await;
        match event {
            EngineEvent::ProgressChanged { progress } => {
                assert_eq!(progress.total, 1);
                assert_eq!(progress.completed, 1);
            }
            _ => unreachable!(),
        }
    }
}
