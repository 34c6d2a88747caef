//! Local relational backend (SQLite).
//!
//! Earlier design variant of the remote store: synchronous CRUD over two
//! tables keyed by integer ids, no realtime push. The subscription contract
//! degrades to a one-shot read delivered at subscribe time, refreshed after
//! each local write. Since every mutation goes through this process, that
//! is equivalent to realtime for a single-device deployment.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{
    doc_matches_query, sort_docs_by_due, RawDocument, RemoteStore, SnapshotEvent, SnapshotSender,
    SnapshotStream,
};
use crate::error::{StoreError, StoreResult};
use crate::types::TaskQuery;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id    TEXT NOT NULL,
    description TEXT NOT NULL,
    due_at      INTEGER,
    completed   INTEGER NOT NULL DEFAULT 0,
    expanded    INTEGER NOT NULL DEFAULT 0,
    reminder_at INTEGER
);
CREATE TABLE IF NOT EXISTS subtasks (
    subtask_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_task_id INTEGER NOT NULL,
    description    TEXT NOT NULL,
    completed      INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(parent_task_id) REFERENCES tasks(task_id)
);
";

struct Inner {
    conn: Connection,
    task_subs: Vec<(TaskQuery, SnapshotSender)>,
    subtask_subs: Vec<(String, SnapshotSender)>,
}

/// SQLite-backed [`RemoteStore`].
pub struct SqliteStore {
    inner: Mutex<Inner>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                task_subs: Vec::new(),
                subtask_subs: Vec::new(),
            }),
        })
    }
}

impl Inner {
    fn task_docs(&self, query: &TaskQuery) -> StoreResult<Vec<RawDocument>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, owner_id, description, due_at, completed, expanded, reminder_at
             FROM tasks WHERE owner_id = ?1",
        )?;
        let rows = stmt.query_map(params![query.owner_id()], |row| {
            Ok(RawDocument {
                id: row.get::<_, i64>(0)?.to_string(),
                fields: json!({
                    "owner_id": row.get::<_, String>(1)?,
                    "description": row.get::<_, String>(2)?,
                    "due_at": row.get::<_, Option<i64>>(3)?,
                    "completed": row.get::<_, bool>(4)?,
                    "expanded": row.get::<_, bool>(5)?,
                    "reminder_at": row.get::<_, Option<i64>>(6)?,
                }),
            })
        })?;
        let mut docs = Vec::new();
        for doc in rows {
            let doc = doc?;
            if doc_matches_query(&doc, query) {
                docs.push(doc);
            }
        }
        sort_docs_by_due(&mut docs);
        Ok(docs)
    }

    fn subtask_docs(&self, task_id: &str) -> StoreResult<Vec<RawDocument>> {
        let parent = parse_id(task_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT subtask_id, description, completed FROM subtasks
             WHERE parent_task_id = ?1 ORDER BY subtask_id ASC",
        )?;
        let rows = stmt.query_map(params![parent], |row| {
            Ok(RawDocument {
                id: row.get::<_, i64>(0)?.to_string(),
                fields: json!({
                    "description": row.get::<_, String>(1)?,
                    "completed": row.get::<_, bool>(2)?,
                }),
            })
        })?;
        let mut docs = Vec::new();
        for doc in rows {
            docs.push(doc?);
        }
        Ok(docs)
    }

    fn task_snapshot(&self, query: &TaskQuery) -> StoreResult<SnapshotEvent> {
        Ok(SnapshotEvent {
            docs: self.task_docs(query)?,
            from_cache: false,
        })
    }

    fn subtask_snapshot(&self, task_id: &str) -> StoreResult<SnapshotEvent> {
        Ok(SnapshotEvent {
            docs: self.subtask_docs(task_id)?,
            from_cache: false,
        })
    }

    /// Push fresh one-shot reads to every live subscription.
    fn refresh_subscriptions(&mut self) {
        let mut closed = Vec::new();
        for (i, (query, tx)) in self.task_subs.iter().enumerate() {
            let push = self.task_snapshot(query);
            if tx.send(push).is_err() {
                closed.push(i);
            }
        }
        for i in closed.into_iter().rev() {
            self.task_subs.remove(i);
        }

        let mut closed = Vec::new();
        for (i, (task_id, tx)) in self.subtask_subs.iter().enumerate() {
            let push = self.subtask_snapshot(task_id);
            if tx.send(push).is_err() {
                closed.push(i);
            }
        }
        for i in closed.into_iter().rev() {
            self.subtask_subs.remove(i);
        }
    }

}

/// Apply a multi-field task update inside the caller's transaction, so a
/// rejected or missing field leaves none of the earlier fields committed.
fn apply_task_fields(conn: &Connection, task_id: i64, fields: &Value) -> StoreResult<()> {
    let map = fields
        .as_object()
        .ok_or_else(|| StoreError::Rejected("field update must be an object".to_string()))?;
    for (key, value) in map {
        let changed = match key.as_str() {
            "description" => conn.execute(
                "UPDATE tasks SET description = ?1 WHERE task_id = ?2",
                params![value.as_str().unwrap_or_default(), task_id],
            )?,
            "due_at" => conn.execute(
                "UPDATE tasks SET due_at = ?1 WHERE task_id = ?2",
                params![value.as_i64(), task_id],
            )?,
            "completed" => conn.execute(
                "UPDATE tasks SET completed = ?1 WHERE task_id = ?2",
                params![value.as_bool().unwrap_or_default(), task_id],
            )?,
            "expanded" => conn.execute(
                "UPDATE tasks SET expanded = ?1 WHERE task_id = ?2",
                params![value.as_bool().unwrap_or_default(), task_id],
            )?,
            "reminder_at" => conn.execute(
                "UPDATE tasks SET reminder_at = ?1 WHERE task_id = ?2",
                params![value.as_i64(), task_id],
            )?,
            other => {
                return Err(StoreError::Rejected(format!("unknown task field: {other}")));
            }
        };
        if changed == 0 {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
    }
    Ok(())
}

fn parse_id(id: &str) -> StoreResult<i64> {
    id.parse::<i64>()
        .map_err(|_| StoreError::Rejected(format!("not a local store id: {id}")))
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn subscribe_tasks(&self, query: TaskQuery) -> StoreResult<SnapshotStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.task_snapshot(&query)?;
        let _ = tx.send(Ok(snapshot));
        inner.task_subs.push((query, tx));
        Ok(rx)
    }

    async fn subscribe_subtasks(&self, task_id: &str) -> StoreResult<SnapshotStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.subtask_snapshot(task_id)?;
        let _ = tx.send(Ok(snapshot));
        inner.subtask_subs.push((task_id.to_string(), tx));
        Ok(rx)
    }

    async fn fetch_subtasks(&self, task_id: &str) -> StoreResult<SnapshotEvent> {
        let inner = self.inner.lock().unwrap();
        inner.subtask_snapshot(task_id)
    }

    async fn create_task(&self, fields: Value) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.conn.execute(
            "INSERT INTO tasks (owner_id, description, due_at, completed, expanded, reminder_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fields.get("owner_id").and_then(Value::as_str).unwrap_or_default(),
                fields.get("description").and_then(Value::as_str).unwrap_or_default(),
                fields.get("due_at").and_then(Value::as_i64),
                fields.get("completed").and_then(Value::as_bool).unwrap_or(false),
                fields.get("expanded").and_then(Value::as_bool).unwrap_or(false),
                fields.get("reminder_at").and_then(Value::as_i64),
            ],
        )?;
        let id = inner.conn.last_insert_rowid().to_string();
        inner.refresh_subscriptions();
        Ok(id)
    }

    async fn update_task(&self, task_id: &str, fields: Value) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = parse_id(task_id)?;
        let tx = inner.conn.transaction()?;
        apply_task_fields(&tx, id, &fields)?;
        tx.commit()?;
        inner.refresh_subscriptions();
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = parse_id(task_id)?;
        let tx = inner.conn.transaction()?;
        tx.execute("DELETE FROM subtasks WHERE parent_task_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM tasks WHERE task_id = ?1", params![id])?;
        tx.commit()?;
        if removed == 0 {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        inner.refresh_subscriptions();
        Ok(())
    }

    async fn complete_task(
        &self,
        task_id: &str,
        completed: bool,
        force_subtasks: &[String],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = parse_id(task_id)?;
        let tx = inner.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET completed = ?1 WHERE task_id = ?2",
            params![completed, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        for sub_id in force_subtasks {
            tx.execute(
                "UPDATE subtasks SET completed = 1 WHERE subtask_id = ?1 AND parent_task_id = ?2",
                params![parse_id(sub_id)?, id],
            )?;
        }
        tx.commit()?;
        inner.refresh_subscriptions();
        Ok(())
    }

    async fn create_subtask(&self, task_id: &str, fields: Value) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let parent = parse_id(task_id)?;
        let exists: Option<i64> = inner
            .conn
            .query_row(
                "SELECT task_id FROM tasks WHERE task_id = ?1",
                params![parent],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        inner.conn.execute(
            "INSERT INTO subtasks (parent_task_id, description, completed) VALUES (?1, ?2, ?3)",
            params![
                parent,
                fields.get("description").and_then(Value::as_str).unwrap_or_default(),
                fields.get("completed").and_then(Value::as_bool).unwrap_or(false),
            ],
        )?;
        let id = inner.conn.last_insert_rowid().to_string();
        inner.refresh_subscriptions();
        Ok(id)
    }

    async fn update_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        fields: Value,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let parent = parse_id(task_id)?;
        let sub = parse_id(subtask_id)?;
        let map = fields
            .as_object()
            .ok_or_else(|| StoreError::Rejected("field update must be an object".to_string()))?;
        // Per-field updates run in one transaction; an early error rolls
        // back the fields already applied.
        let tx = inner.conn.transaction()?;
        for (key, value) in map {
            let changed = match key.as_str() {
                "description" => tx.execute(
                    "UPDATE subtasks SET description = ?1
                     WHERE subtask_id = ?2 AND parent_task_id = ?3",
                    params![value.as_str().unwrap_or_default(), sub, parent],
                )?,
                "completed" => tx.execute(
                    "UPDATE subtasks SET completed = ?1
                     WHERE subtask_id = ?2 AND parent_task_id = ?3",
                    params![value.as_bool().unwrap_or_default(), sub, parent],
                )?,
                other => {
                    return Err(StoreError::Rejected(format!(
                        "unknown subtask field: {other}"
                    )));
                }
            };
            if changed == 0 {
                return Err(StoreError::NotFound(subtask_id.to_string()));
            }
        }
        tx.commit()?;
        inner.refresh_subscriptions();
        Ok(())
    }

    async fn delete_subtask(&self, task_id: &str, subtask_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.conn.execute(
            "DELETE FROM subtasks WHERE subtask_id = ?1 AND parent_task_id = ?2",
            params![parse_id(subtask_id)?, parse_id(task_id)?],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound(subtask_id.to_string()));
        }
        inner.refresh_subscriptions();
        Ok(())
    }
}
