//! Sync and projection-cache engine for a personal task manager.
//!
//! The engine mirrors a remote per-owner task collection (tasks with lazily
//! loaded subtask lists) into an in-memory projection, applies mutations
//! optimistically with conditional rollback, and publishes display-ready
//! row lists plus minimal keyed deltas for incremental rendering.
//!
//! ```no_run
//! use std::sync::Arc;
//! use daytask_sync::{EngineConfig, MemoryStore, TaskDraft, TaskEngine, ReminderOffset};
//!
//! # async fn demo() {
//! let store = Arc::new(MemoryStore::new());
//! let (engine, mut events) = TaskEngine::spawn(store, EngineConfig::for_owner("me"));
//! engine
//!     .add_task(TaskDraft {
//!         description: "water the plants".to_string(),
//!         due_at: None,
//!         reminder: ReminderOffset::None,
//!     })
//!     .outcome()
//!     .await
//!     .unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod mutate;
pub mod progress;
pub mod rules;
pub mod store;
pub mod sync;
pub mod types;

pub use config::EngineConfig;
pub use diff::{DiffRow, RowKey, RowOp};
pub use engine::{EngineEvent, EngineEvents, ProjectionSnapshot, TaskEngine, TaskEngineHandle};
pub use error::{EntityKind, StoreError, StoreResult, SyncError};
pub use mutate::MutationTicket;
pub use progress::progress_of;
pub use store::memory::MemoryStore;
pub use store::sqlite::SqliteStore;
pub use store::{RawDocument, RemoteStore, SnapshotEvent, SnapshotStream};
pub use types::{
    DisplayRow, Progress, ReminderOffset, SubTask, Task, TaskDraft, TaskEdit, TaskQuery, ViewMode,
};
