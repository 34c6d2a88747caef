//! Optimistic mutation bookkeeping.
//!
//! Every optimistic mutation gets a per-entity sequence number before its
//! remote write is issued. When the write later fails, the captured
//! pre-mutation state is restored *only if* the entity's counter has not
//! moved on, so a rollback never clobbers a newer optimistic change or a
//! snapshot that already superseded it.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::SyncError;

/// The unit of rollback granularity. Subtask-level writes roll back the
/// whole cached list of their parent, hence a distinct key from the parent
/// task's own fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Task(String),
    SubtaskList(String),
}

impl EntityKey {
    pub fn task_id(&self) -> &str {
        match self {
            EntityKey::Task(id) | EntityKey::SubtaskList(id) => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct MutationCoordinator {
    counters: HashMap<EntityKey, u64>,
}

impl MutationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new optimistic mutation against an entity and return its
    /// sequence number.
    pub fn begin(&mut self, key: &EntityKey) -> u64 {
        let counter = self.counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Whether the given mutation is still the latest for its entity. A
    /// failed write may only roll back while this holds.
    pub fn is_current(&self, key: &EntityKey, seq: u64) -> bool {
        self.counters.get(key) == Some(&seq)
    }

    /// Retire all outstanding sequence numbers for an entity, e.g. once a
    /// confirmed snapshot has made rollback meaningless.
    pub fn retire(&mut self, key: &EntityKey) {
        if let Some(counter) = self.counters.get_mut(key) {
            *counter += 1;
        }
    }

    pub fn forget(&mut self, task_id: &str) {
        self.counters
            .retain(|key, _| key.task_id() != task_id);
    }
}

/// Caller-side handle for the eventual outcome of a mutation. The
/// optimistic effect (if any) is visible before this resolves; awaiting it
/// is optional.
#[derive(Debug)]
pub struct MutationTicket {
    rx: oneshot::Receiver<Result<(), SyncError>>,
}

pub(crate) fn mutation_ticket() -> (MutationTicket, oneshot::Sender<Result<(), SyncError>>) {
    let (tx, rx) = oneshot::channel();
    (MutationTicket { rx }, tx)
}

impl MutationTicket {
    /// Wait for the write to settle. An engine shutdown before settlement
    /// reports as [`SyncError::EngineStopped`].
    pub async fn outcome(self) -> Result<(), SyncError> {
        self.rx.await.unwrap_or(Err(SyncError::EngineStopped))
    }
}
