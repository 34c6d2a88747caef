//! Subscription lifecycle and snapshot normalization.
//!
//! Owns the store-side subscriptions on behalf of the engine. Each
//! subscription gets a forwarder task that pipes snapshot pushes into a
//! single channel the engine selects on, tagged with a generation number.
//! Resubscribing bumps the generation *synchronously*, so any push from an
//! abandoned subscription still in flight is recognized as stale and
//! dropped instead of clobbering the projection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{StoreResult, SyncError};
use crate::store::{RawDocument, RemoteStore, SnapshotEvent, SnapshotStream};
use crate::types::{SubTask, Task, TaskQuery};

/// A generation-tagged push from some live (or recently cancelled)
/// subscription, as delivered to the engine loop.
#[derive(Debug)]
pub enum SyncMessage {
    Tasks {
        generation: u64,
        push: StoreResult<SnapshotEvent>,
    },
    Subtasks {
        task_id: String,
        generation: u64,
        push: StoreResult<SnapshotEvent>,
    },
}

pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    tx: mpsc::UnboundedSender<SyncMessage>,
    task_generation: u64,
    task_forwarder: Option<JoinHandle<()>>,
    subtask_generations: HashMap<String, u64>,
    subtask_forwarders: HashMap<String, JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>) -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                tx,
                task_generation: 0,
                task_forwarder: None,
                subtask_generations: HashMap::new(),
                subtask_forwarders: HashMap::new(),
            },
            rx,
        )
    }

    /// Replace the task subscription with one for the given query. The old
    /// forwarder is aborted and its generation retired before the new
    /// subscription is opened.
    pub async fn resubscribe_tasks(&mut self, query: TaskQuery) -> Result<(), SyncError> {
        self.task_generation += 1;
        if let Some(handle) = self.task_forwarder.take() {
            handle.abort();
        }
        let generation = self.task_generation;
        let stream = self
            .store
            .subscribe_tasks(query)
            .await
            .map_err(|_| SyncError::TransientConnectivity)?;
        let tx = self.tx.clone();
        self.task_forwarder = Some(tokio::spawn(forward(stream, tx, move |push| {
            SyncMessage::Tasks { generation, push }
        })));
        Ok(())
    }

    /// Open (or replace) the subtask subscription for one task.
    pub async fn subscribe_subtasks(&mut self, task_id: &str) -> Result<(), SyncError> {
        let generation = {
            let slot = self
                .subtask_generations
                .entry(task_id.to_string())
                .or_insert(0);
            *slot += 1;
            *slot
        };
        if let Some(handle) = self.subtask_forwarders.remove(task_id) {
            handle.abort();
        }
        let stream = self
            .store
            .subscribe_subtasks(task_id)
            .await
            .map_err(|_| SyncError::TransientConnectivity)?;
        let tx = self.tx.clone();
        let id = task_id.to_string();
        self.subtask_forwarders.insert(
            task_id.to_string(),
            tokio::spawn(forward(stream, tx, move |push| SyncMessage::Subtasks {
                task_id: id.clone(),
                generation,
                push,
            })),
        );
        Ok(())
    }

    /// Cancel the subtask subscription for one task (e.g. after deletion).
    /// Retires the generation so in-flight pushes are dropped.
    pub fn unsubscribe_subtasks(&mut self, task_id: &str) {
        if let Some(generation) = self.subtask_generations.get_mut(task_id) {
            *generation += 1;
        }
        if let Some(handle) = self.subtask_forwarders.remove(task_id) {
            handle.abort();
        }
    }

    pub fn is_current_task_generation(&self, generation: u64) -> bool {
        generation == self.task_generation
    }

    pub fn is_current_subtask_generation(&self, task_id: &str, generation: u64) -> bool {
        self.subtask_generations.get(task_id) == Some(&generation)
    }

    pub fn has_subtask_subscription(&self, task_id: &str) -> bool {
        self.subtask_forwarders.contains_key(task_id)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.task_forwarder.take() {
            handle.abort();
        }
        for (_, handle) in self.subtask_forwarders.drain() {
            handle.abort();
        }
    }
}

/// Pump one snapshot stream into the shared sync channel until either side
/// closes.
async fn forward<F>(mut stream: SnapshotStream, tx: mpsc::UnboundedSender<SyncMessage>, wrap: F)
where
    F: Fn(StoreResult<SnapshotEvent>) -> SyncMessage + Send + 'static,
{
    while let Some(push) = stream.recv().await {
        if tx.send(wrap(push)).is_err() {
            break;
        }
    }
}

/// Decode the raw documents of a task snapshot, skipping malformed records
/// so one bad document cannot take down the whole subscription.
pub fn normalize_tasks(docs: Vec<RawDocument>) -> Vec<Task> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value::<Task>(doc.fields) {
            Ok(mut task) => {
                task.id = doc.id;
                Some(task)
            }
            Err(err) => {
                warn!(doc_id = %doc.id, error = %err, "skipping malformed task record");
                None
            }
        })
        .collect()
}

/// Decode the raw documents of a subtask snapshot, skipping malformed
/// records.
pub fn normalize_subtasks(task_id: &str, docs: Vec<RawDocument>) -> Vec<SubTask> {
    docs.into_iter()
        .filter_map(
            |doc| match serde_json::from_value::<SubTask>(doc.fields) {
                Ok(mut sub) => {
                    sub.id = doc.id;
                    sub.parent_task_id = task_id.to_string();
                    Some(sub)
                }
                Err(err) => {
                    warn!(doc_id = %doc.id, error = %err, "skipping malformed subtask record");
                    None
                }
            },
        )
        .collect()
}
