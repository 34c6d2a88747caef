//! Remote document-store contract consumed by the sync engine.
//!
//! The store is an opaque capability: a collection of task documents keyed
//! by opaque id, each with a subtask sub-collection. Queries support
//! realtime subscriptions that deliver the *full current result set* on
//! every change (never an incremental patch), tagged with cache/offline
//! provenance. Two backends ship with the crate: a realtime in-memory store
//! and a local relational (SQLite) variant that degrades the subscription
//! contract to one-shot reads refreshed after each local write.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreResult;
use crate::types::TaskQuery;

/// One document as delivered by a backend: opaque key plus raw fields.
/// Decoding (and skipping malformed records) happens in the sync engine.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub id: String,
    pub fields: Value,
}

/// A full result set for one subscription, with provenance.
#[derive(Debug, Clone)]
pub struct SnapshotEvent {
    pub docs: Vec<RawDocument>,
    /// True when served from a local cache while offline.
    pub from_cache: bool,
}

/// Inbound channel of a subscription. Transport failures travel in-band as
/// `Err`, leaving the consumer's last known state untouched. Dropping the
/// receiver cancels the subscription.
pub type SnapshotStream = mpsc::UnboundedReceiver<StoreResult<SnapshotEvent>>;

pub(crate) type SnapshotSender = mpsc::UnboundedSender<StoreResult<SnapshotEvent>>;

/// The remote store capability. Injected into the engine so the realtime
/// and local backends are interchangeable.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Subscribe to the tasks matching a query. The current result set is
    /// delivered immediately, then again after every relevant change.
    async fn subscribe_tasks(&self, query: TaskQuery) -> StoreResult<SnapshotStream>;

    /// Subscribe to a task's subtask sub-collection.
    async fn subscribe_subtasks(&self, task_id: &str) -> StoreResult<SnapshotStream>;

    /// One-shot read of a task's subtasks (used by the lazy completion
    /// check before any subscription exists).
    async fn fetch_subtasks(&self, task_id: &str) -> StoreResult<SnapshotEvent>;

    /// Create a task document; the store assigns and returns the id.
    async fn create_task(&self, fields: Value) -> StoreResult<String>;

    /// Field-level update of a task document.
    async fn update_task(&self, task_id: &str, fields: Value) -> StoreResult<()>;

    /// Atomically delete a task and its entire subtask sub-collection.
    async fn delete_task(&self, task_id: &str) -> StoreResult<()>;

    /// Atomically set a task's completion flag and force-complete the given
    /// subtasks in the same batch.
    async fn complete_task(
        &self,
        task_id: &str,
        completed: bool,
        force_subtasks: &[String],
    ) -> StoreResult<()>;

    /// Create a subtask under a task; the store assigns and returns the id.
    async fn create_subtask(&self, task_id: &str, fields: Value) -> StoreResult<String>;

    /// Field-level update of a subtask document.
    async fn update_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
        fields: Value,
    ) -> StoreResult<()>;

    async fn delete_subtask(&self, task_id: &str, subtask_id: &str) -> StoreResult<()>;
}

/// Order documents for delivery: ascending by `due_at`, undated last, id as
/// the tiebreak. Matches the display ordering so snapshots arrive sorted.
pub(crate) fn sort_docs_by_due(docs: &mut [RawDocument]) {
    docs.sort_by(|a, b| {
        let due_a = a.fields.get("due_at").and_then(Value::as_i64);
        let due_b = b.fields.get("due_at").and_then(Value::as_i64);
        match (due_a, due_b) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        }
    });
}

/// Whether a raw task document matches a query.
pub(crate) fn doc_matches_query(doc: &RawDocument, query: &TaskQuery) -> bool {
    let owner = doc
        .fields
        .get("owner_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match query {
        TaskQuery::ForOwner { owner_id } => owner == owner_id,
        TaskQuery::ForOwnerOnDay {
            owner_id,
            start_ms,
            end_ms,
        } => {
            if owner != owner_id {
                return false;
            }
            match doc.fields.get("due_at").and_then(Value::as_i64) {
                Some(due) => due >= *start_ms && due <= *end_ms,
                // Day-range queries never match undated tasks.
                None => false,
            }
        }
    }
}
