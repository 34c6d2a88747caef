//! Realtime in-memory backend.
//!
//! Behaves like the hosted document store: subscriptions get the full
//! matching result set immediately and after every change. Includes test
//! hooks for offline provenance, injected write failures, and transport
//! errors, so engine behavior under degraded conditions is exercisable
//! without a network.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    doc_matches_query, sort_docs_by_due, RawDocument, RemoteStore, SnapshotEvent, SnapshotSender,
    SnapshotStream,
};
use crate::error::{StoreError, StoreResult};
use crate::types::TaskQuery;

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<String, Value>,
    /// task id -> subtask id -> fields
    subtasks: BTreeMap<String, BTreeMap<String, Value>>,
    task_subs: Vec<(TaskQuery, SnapshotSender)>,
    subtask_subs: Vec<(String, SnapshotSender)>,
    next_id: u64,
    offline: bool,
    fail_next_writes: u32,
}

/// In-memory [`RemoteStore`] with realtime push.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag subsequent snapshot deliveries as served-from-cache.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    /// Make the next `count` writes fail with a rejection.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().unwrap().fail_next_writes = count;
    }

    /// Deliver a transport-level failure to every live subscription.
    pub fn push_transport_error(&self) {
        let inner = self.inner.lock().unwrap();
        for (_, tx) in &inner.task_subs {
            let _ = tx.send(Err(StoreError::Unavailable("transport error".to_string())));
        }
        for (_, tx) in &inner.subtask_subs {
            let _ = tx.send(Err(StoreError::Unavailable("transport error".to_string())));
        }
    }

    /// Seed a task directly, bypassing the engine (simulates another device).
    pub fn seed_task(&self, fields: Value) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.fresh_id("task");
        inner.tasks.insert(id.clone(), fields);
        inner.broadcast();
        id
    }

    /// Seed a subtask directly, bypassing the engine.
    pub fn seed_subtask(&self, task_id: &str, fields: Value) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.fresh_id("sub");
        inner
            .subtasks
            .entry(task_id.to_string())
            .or_default()
            .insert(id.clone(), fields);
        inner.broadcast();
        id
    }

    /// Delete a task out from under the engine (external deletion).
    pub fn external_delete_task(&self, task_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.remove(task_id);
        inner.subtasks.remove(task_id);
        inner.broadcast();
    }
}

impl Inner {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn take_injected_failure(&mut self) -> StoreResult<()> {
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(StoreError::Rejected("injected write failure".to_string()));
        }
        Ok(())
    }

    fn task_snapshot(&self, query: &TaskQuery) -> SnapshotEvent {
        let mut docs: Vec<RawDocument> = self
            .tasks
            .iter()
            .map(|(id, fields)| RawDocument {
                id: id.clone(),
                fields: fields.clone(),
            })
            .filter(|doc| doc_matches_query(doc, query))
            .collect();
        sort_docs_by_due(&mut docs);
        SnapshotEvent {
            docs,
            from_cache: self.offline,
        }
    }

    fn subtask_snapshot(&self, task_id: &str) -> SnapshotEvent {
        let docs = self
            .subtasks
            .get(task_id)
            .map(|subs| {
                subs.iter()
                    .map(|(id, fields)| RawDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        SnapshotEvent {
            docs,
            from_cache: self.offline,
        }
    }

    /// Re-run every live subscription and push fresh result sets, pruning
    /// subscriptions whose receiver was dropped.
    fn broadcast(&mut self) {
        let snapshots: Vec<(usize, SnapshotEvent)> = self
            .task_subs
            .iter()
            .enumerate()
            .map(|(i, (query, _))| (i, self.task_snapshot(query)))
            .collect();
        let mut closed_tasks = Vec::new();
        for (i, snapshot) in snapshots {
            if self.task_subs[i].1.send(Ok(snapshot)).is_err() {
                closed_tasks.push(i);
            }
        }
        for i in closed_tasks.into_iter().rev() {
            self.task_subs.remove(i);
        }

        let snapshots: Vec<(usize, SnapshotEvent)> = self
            .subtask_subs
            .iter()
            .enumerate()
            .map(|(i, (task_id, _))| (i, self.subtask_snapshot(task_id)))
            .collect();
        let mut closed_subs = Vec::new();
        for (i, snapshot) in snapshots {
            if self.subtask_subs[i].1.send(Ok(snapshot)).is_err() {
                closed_subs.push(i);
            }
        }
        for i in closed_subs.into_iter().rev() {
            self.subtask_subs.remove(i);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn subscribe_tasks(&self, query: TaskQuery) -> StoreResult<SnapshotStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let _ = tx.send(Ok(inner.task_snapshot(&query)));
        inner.task_subs.push((query, tx));
        Ok(rx)
    }

    async fn subscribe_subtasks(&self, task_id: &str) -> StoreResult<SnapshotStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let _ = tx.send(Ok(inner.subtask_snapshot(task_id)));
        inner.subtask_subs.push((task_id.to_string(), tx));
        Ok(rx)
    }

    async fn fetch_subtasks(&self, task_id: &str) -> StoreResult<SnapshotEvent> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.subtask_snapshot(task_id))
    }

    async fn create_task(&self, fields: Value) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        let id = inner.fresh_id("task");
        inner.tasks.insert(id.clone(), fields);
        inner.broadcast();
        Ok(id)
    }

    async fn update_task(&self, task_id: &str, fields: Value) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        let doc = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        merge_fields(doc, fields);
        inner.broadcast();
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        if inner.tasks.remove(task_id).is_none() {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        inner.subtasks.remove(task_id);
        inner.broadcast();
        Ok(())
    }

    async fn complete_task(
        &self,
        task_id: &str,
        completed: bool,
        force_subtasks: &[String],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        let doc = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        merge_fields(doc, serde_json::json!({ "completed": completed }));
        if let Some(subs) = inner.subtasks.get_mut(task_id) {
            for sub_id in force_subtasks {
                if let Some(sub) = subs.get_mut(sub_id) {
                    merge_fields(sub, serde_json::json!({ "completed": true }));
                }
            }
        }
        inner.broadcast();
        Ok(())
    }

    async fn create_subtask(&self, task_id: &str, fields: Value) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        if !inner.tasks.contains_key(task_id) {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        let id = inner.fresh_id("sub");
        inner
            .subtasks
            .entry(task_id.to_string())
            .or_default()
            .insert(id.clone(), fields);
        inner.broadcast();
        Ok(id)
    }

    async fn update_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        fields: Value,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        let doc = inner
            .subtasks
            .get_mut(task_id)
            .and_then(|subs| subs.get_mut(subtask_id))
            .ok_or_else(|| StoreError::NotFound(subtask_id.to_string()))?;
        merge_fields(doc, fields);
        inner.broadcast();
        Ok(())
    }

    async fn delete_subtask(&self, task_id: &str, subtask_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_injected_failure()?;
        let removed = inner
            .subtasks
            .get_mut(task_id)
            .and_then(|subs| subs.remove(subtask_id));
        if removed.is_none() {
            return Err(StoreError::NotFound(subtask_id.to_string()));
        }
        inner.broadcast();
        Ok(())
    }
}

/// Last-write-wins merge of individual fields into a document.
fn merge_fields(doc: &mut Value, fields: Value) {
    if let (Some(target), Some(updates)) = (doc.as_object_mut(), fields.as_object()) {
        for (key, value) in updates {
            target.insert(key.clone(), value.clone());
        }
    }
}
