//! Typed errors for the sync engine and its storage backends.

use thiserror::Error;

/// Which kind of entity a mutation referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    Subtask,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Task => write!(f, "task"),
            EntityKind::Subtask => write!(f, "subtask"),
        }
    }
}

/// Consumer-facing error taxonomy.
///
/// Validation errors are rejected before any remote call and leave the cache
/// untouched. `TransientConnectivity` means the last known cache state is
/// retained and the view may be stale. `WriteConflict` means an optimistic
/// mutation failed remotely and was rolled back (unless a newer mutation on
/// the same entity had already superseded it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("description must not be empty")]
    EmptyDescription,

    #[error("task {task_id} still has incomplete subtasks")]
    IncompleteSubtasks { task_id: String },

    #[error("connectivity lost; last known data retained")]
    TransientConnectivity,

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("remote write failed: {reason}")]
    WriteConflict { reason: String },

    #[error("engine stopped")]
    EngineStopped,
}

impl SyncError {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind: EntityKind::Task,
            id: id.into(),
        }
    }

    pub fn subtask_not_found(id: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind: EntityKind::Subtask,
            id: id.into(),
        }
    }

    pub fn write_conflict(reason: impl Into<String>) -> Self {
        SyncError::WriteConflict {
            reason: reason.into(),
        }
    }
}

/// Backend-facing errors raised by a [`crate::store::RemoteStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure; the data may well exist.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The referenced document no longer exists remotely.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The write was refused for an unspecified remote reason.
    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(anyhow::Error::from(err))
    }
}

impl StoreError {
    /// Map a failed write onto the consumer-facing taxonomy.
    pub fn into_sync_error(self, kind: EntityKind, id: &str) -> SyncError {
        match self {
            StoreError::NotFound(_) => SyncError::NotFound {
                kind,
                id: id.to_string(),
            },
            other => SyncError::write_conflict(other.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
