//! The engine running over the local SQLite backend instead of the
//! realtime store. Exercises backend interchangeability and on-disk
//! persistence across engine restarts.

use std::sync::Arc;
use std::time::Duration;

use daytask_sync::{
    EngineConfig, ReminderOffset, SqliteStore, Task, TaskDraft, TaskEngine, TaskEngineHandle,
};

fn draft(description: &str, due_at: Option<i64>) -> TaskDraft {
    TaskDraft {
        description: description.to_string(),
        due_at,
        reminder: ReminderOffset::None,
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn spawn_engine(store: Arc<SqliteStore>) -> TaskEngineHandle {
    let (engine, _events) = TaskEngine::spawn(store, EngineConfig::for_owner("u1"));
    engine
}

/// Task rows of the projection, skipping the grouped view's date headers.
fn task_rows(engine: &TaskEngineHandle) -> Vec<Task> {
    engine
        .display_rows()
        .iter()
        .filter_map(|row| row.as_task().cloned())
        .collect()
}

#[tokio::test]
async fn full_lifecycle_over_sqlite() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = spawn_engine(store);

    engine.add_task(draft("buy milk", Some(100))).outcome().await.unwrap();
    wait_until("task appears", || task_rows(&engine).len() == 1).await;
    let id = task_rows(&engine)[0].id.clone();

    engine.add_subtask(&id, "check the fridge").outcome().await.unwrap();
    wait_until("subtask appears", || engine.subtasks_of(&id).len() == 1).await;
    let sub_id = engine.subtasks_of(&id)[0].id.clone();

    engine
        .toggle_subtask_completion(&id, &sub_id, true)
        .outcome()
        .await
        .unwrap();
    engine.toggle_task_completion(&id, true).outcome().await.unwrap();
    wait_until("task completes", || {
        task_rows(&engine).first().is_some_and(|t| t.completed)
    })
    .await;
    assert_eq!(engine.progress().percentage, 100);

    engine.delete_task(&id).outcome().await.unwrap();
    wait_until("task removed", || engine.display_rows().is_empty()).await;
}

#[tokio::test]
async fn tasks_survive_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = spawn_engine(store);
        engine.add_task(draft("persisted", None)).outcome().await.unwrap();
        wait_until("task appears", || task_rows(&engine).len() == 1).await;
        engine.shutdown();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let engine = spawn_engine(store);
    wait_until("task reloaded", || task_rows(&engine).len() == 1).await;
    assert_eq!(task_rows(&engine)[0].description, "persisted");
}
