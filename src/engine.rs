//! The engine actor: single writer over the projection cache.
//!
//! All state lives inside one tokio task. Consumers talk to it through a
//! cloneable handle (commands over an unbounded channel, mutation outcomes
//! over per-call oneshots) and observe it through an event stream plus a
//! lock-free published snapshot. Snapshots from the store are authoritative:
//! they overwrite optimistic state wholesale, and a confirmed snapshot
//! retires any rollback still pending against the entities it covers.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::{ProjectionCache, SubtaskListState, TaskFieldsState};
use crate::config::EngineConfig;
use crate::diff::{build_display_rows, reconcile, RowOp};
use crate::error::{EntityKind, StoreError, SyncError};
use crate::mutate::{mutation_ticket, EntityKey, MutationCoordinator, MutationTicket};
use crate::progress::progress_of;
use crate::rules;
use crate::store::RemoteStore;
use crate::sync::{normalize_subtasks, normalize_tasks, SyncEngine, SyncMessage};
use crate::types::{
    DisplayRow, Progress, SubTask, Task, TaskDraft, TaskEdit, TaskQuery, ViewMode,
};

/// Everything a consumer can render, swapped atomically on each change.
#[derive(Debug, Default)]
pub struct ProjectionSnapshot {
    pub rows: Vec<DisplayRow>,
    pub progress: Progress,
    /// Materialized subtask lists, keyed by task id. Absent means not
    /// loaded yet.
    pub subtasks: HashMap<String, Vec<SubTask>>,
}

/// Push notifications emitted by the engine.
#[derive(Debug)]
pub enum EngineEvent {
    /// The display projection changed; `ops` is the minimal keyed delta.
    RowsChanged { ops: Vec<RowOp<DisplayRow>> },
    /// One task's subtask list changed.
    SubtasksChanged {
        task_id: String,
        ops: Vec<RowOp<SubTask>>,
    },
    ProgressChanged { progress: Progress },
    /// Offline/online transitions, derived from snapshot provenance and
    /// transport errors.
    Connectivity { offline: bool },
}

/// Inbound side of the engine's event stream.
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

type Ticket = oneshot::Sender<Result<(), SyncError>>;

enum Command {
    SetView {
        mode: ViewMode,
        done: oneshot::Sender<Result<(), SyncError>>,
    },
    AddTask {
        draft: TaskDraft,
        ticket: Ticket,
    },
    EditTask {
        task_id: String,
        edit: TaskEdit,
        ticket: Ticket,
    },
    DeleteTask {
        task_id: String,
        ticket: Ticket,
    },
    ToggleTaskCompletion {
        task_id: String,
        completed: bool,
        ticket: Ticket,
    },
    ToggleExpanded {
        task_id: String,
        ticket: Ticket,
    },
    AddSubtask {
        task_id: String,
        description: String,
        ticket: Ticket,
    },
    DeleteSubtask {
        task_id: String,
        subtask_id: String,
        ticket: Ticket,
    },
    ToggleSubtaskCompletion {
        task_id: String,
        subtask_id: String,
        completed: bool,
        ticket: Ticket,
    },
    EditSubtaskDescription {
        task_id: String,
        subtask_id: String,
        description: String,
        ticket: Ticket,
    },
    LoadSubtasks {
        task_id: String,
        done: oneshot::Sender<Result<(), SyncError>>,
    },
    Shutdown,
    // Internal marshalling back into the actor.
    SubtasksFetched {
        task_id: String,
        completed: bool,
        fetched: Result<Vec<SubTask>, SyncError>,
        ticket: Ticket,
    },
    WriteSettled {
        rollback: Rollback,
        kind: EntityKind,
        entity_id: String,
        outcome: Result<(), StoreError>,
        ticket: Ticket,
    },
}

/// Pre-mutation capture carried by an in-flight write. Each part is scoped
/// to the entity the mutation actually touched and gated by that entity's
/// own sequence number, so a failed task-field write can never revert a
/// newer subtask-list mutation or vice versa.
#[derive(Debug)]
struct Rollback {
    task_id: String,
    task: Option<(u64, TaskFieldsState)>,
    subtasks: Option<(u64, SubtaskListState)>,
}

/// Entry point. [`TaskEngine::spawn`] starts the actor and hands back its
/// handle and event stream.
pub struct TaskEngine;

impl TaskEngine {
    pub fn spawn(store: Arc<dyn RemoteStore>, config: EngineConfig) -> (TaskEngineHandle, EngineEvents) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sync, sync_rx) = SyncEngine::new(store.clone());
        let published = Arc::new(ArcSwap::from_pointee(ProjectionSnapshot::default()));

        let actor = Actor {
            store,
            config,
            view: ViewMode::AllGrouped,
            cache: ProjectionCache::new(),
            sync,
            sync_rx,
            coordinator: MutationCoordinator::new(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            events: event_tx,
            published: published.clone(),
            rows: Vec::new(),
            progress: Progress::default(),
            subtask_rows: HashMap::new(),
            offline: false,
        };
        tokio::spawn(actor.run());

        (TaskEngineHandle { cmd_tx, published }, event_rx)
    }
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct TaskEngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    published: Arc<ArcSwap<ProjectionSnapshot>>,
}

impl TaskEngineHandle {
    /// The current display projection (rows of the active view).
    pub fn display_rows(&self) -> Vec<DisplayRow> {
        self.published.load().rows.clone()
    }

    pub fn progress(&self) -> Progress {
        self.published.load().progress
    }

    /// The cached subtask list of a task; empty when not loaded.
    pub fn subtasks_of(&self, task_id: &str) -> Vec<SubTask> {
        self.published
            .load()
            .subtasks
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The full published snapshot, without copying.
    pub fn snapshot(&self) -> Arc<ProjectionSnapshot> {
        self.published.load_full()
    }

    /// Switch the active view; resolves once the backing query has been
    /// resubscribed and the projection rebuilt.
    pub async fn set_view(&self, mode: ViewMode) -> Result<(), SyncError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetView { mode, done })
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.unwrap_or(Err(SyncError::EngineStopped))
    }

    /// Begin a subtask subscription for a task; resolves once the
    /// subscription is open (the list itself arrives as an event).
    pub async fn load_subtasks(&self, task_id: &str) -> Result<(), SyncError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LoadSubtasks {
                task_id: task_id.to_string(),
                done,
            })
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.unwrap_or(Err(SyncError::EngineStopped))
    }

    pub fn add_task(&self, draft: TaskDraft) -> MutationTicket {
        self.mutation(|ticket| Command::AddTask { draft, ticket })
    }

    pub fn edit_task(&self, task_id: &str, edit: TaskEdit) -> MutationTicket {
        let task_id = task_id.to_string();
        self.mutation(|ticket| Command::EditTask {
            task_id,
            edit,
            ticket,
        })
    }

    pub fn delete_task(&self, task_id: &str) -> MutationTicket {
        let task_id = task_id.to_string();
        self.mutation(|ticket| Command::DeleteTask { task_id, ticket })
    }

    pub fn toggle_task_completion(&self, task_id: &str, completed: bool) -> MutationTicket {
        let task_id = task_id.to_string();
        self.mutation(|ticket| Command::ToggleTaskCompletion {
            task_id,
            completed,
            ticket,
        })
    }

    pub fn toggle_expanded(&self, task_id: &str) -> MutationTicket {
        let task_id = task_id.to_string();
        self.mutation(|ticket| Command::ToggleExpanded { task_id, ticket })
    }

    pub fn add_subtask(&self, task_id: &str, description: &str) -> MutationTicket {
        let task_id = task_id.to_string();
        let description = description.to_string();
        self.mutation(|ticket| Command::AddSubtask {
            task_id,
            description,
            ticket,
        })
    }

    pub fn delete_subtask(&self, task_id: &str, subtask_id: &str) -> MutationTicket {
        let task_id = task_id.to_string();
        let subtask_id = subtask_id.to_string();
        self.mutation(|ticket| Command::DeleteSubtask {
            task_id,
            subtask_id,
            ticket,
        })
    }

    pub fn toggle_subtask_completion(
        &self,
        task_id: &str,
        subtask_id: &str,
        completed: bool,
    ) -> MutationTicket {
        let task_id = task_id.to_string();
        let subtask_id = subtask_id.to_string();
        self.mutation(|ticket| Command::ToggleSubtaskCompletion {
            task_id,
            subtask_id,
            completed,
            ticket,
        })
    }

    pub fn edit_subtask_description(
        &self,
        task_id: &str,
        subtask_id: &str,
        description: &str,
    ) -> MutationTicket {
        let task_id = task_id.to_string();
        let subtask_id = subtask_id.to_string();
        let description = description.to_string();
        self.mutation(|ticket| Command::EditSubtaskDescription {
            task_id,
            subtask_id,
            description,
            ticket,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    fn mutation(&self, make: impl FnOnce(Ticket) -> Command) -> MutationTicket {
        let (ticket, tx) = mutation_ticket();
        // A failed send drops the sender, which the ticket reports as
        // EngineStopped.
        let _ = self.cmd_tx.send(make(tx));
        ticket
    }
}

struct Actor {
    store: Arc<dyn RemoteStore>,
    config: EngineConfig,
    view: ViewMode,
    cache: ProjectionCache,
    sync: SyncEngine,
    sync_rx: mpsc::UnboundedReceiver<SyncMessage>,
    coordinator: MutationCoordinator,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
    published: Arc<ArcSwap<ProjectionSnapshot>>,
    rows: Vec<DisplayRow>,
    progress: Progress,
    subtask_rows: HashMap<String, Vec<SubTask>>,
    offline: bool,
}

impl Actor {
    async fn run(mut self) {
        let query = TaskQuery::for_view(&self.config.owner_id, &self.view);
        if let Err(err) = self.sync.resubscribe_tasks(query).await {
            warn!(error = %err, "initial task subscription failed");
            self.set_offline(true);
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(msg) = self.sync_rx.recv() => self.handle_sync(msg),
            }
        }
        info!("task engine stopped");
    }

    /// Returns false on shutdown.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetView { mode, done } => {
                self.view = mode;
                let query = TaskQuery::for_view(&self.config.owner_id, &self.view);
                let result = self.sync.resubscribe_tasks(query).await;
                // The cached tasks are re-projected immediately; the fresh
                // snapshot refines them once it arrives.
                self.refresh_rows();
                let _ = done.send(result);
            }
            Command::AddTask { draft, ticket } => self.add_task(draft, ticket),
            Command::EditTask {
                task_id,
                edit,
                ticket,
            } => self.edit_task(&task_id, edit, ticket),
            Command::DeleteTask { task_id, ticket } => self.delete_task(&task_id, ticket),
            Command::ToggleTaskCompletion {
                task_id,
                completed,
                ticket,
            } => self.toggle_task_completion(&task_id, completed, ticket),
            Command::ToggleExpanded { task_id, ticket } => {
                self.toggle_expanded(&task_id, ticket).await;
            }
            Command::AddSubtask {
                task_id,
                description,
                ticket,
            } => self.add_subtask(&task_id, &description, ticket).await,
            Command::DeleteSubtask {
                task_id,
                subtask_id,
                ticket,
            } => self.delete_subtask(&task_id, &subtask_id, ticket),
            Command::ToggleSubtaskCompletion {
                task_id,
                subtask_id,
                completed,
                ticket,
            } => self.toggle_subtask_completion(&task_id, &subtask_id, completed, ticket),
            Command::EditSubtaskDescription {
                task_id,
                subtask_id,
                description,
                ticket,
            } => self.edit_subtask_description(&task_id, &subtask_id, &description, ticket),
            Command::LoadSubtasks { task_id, done } => {
                let result = self.load_subtasks(&task_id).await;
                let _ = done.send(result);
            }
            Command::Shutdown => return false,
            Command::SubtasksFetched {
                task_id,
                completed,
                fetched,
                ticket,
            } => match fetched {
                Ok(subs) => {
                    self.cache.apply_subtask_snapshot(&task_id, subs);
                    self.refresh_subtasks(&task_id);
                    self.complete_task_checked(&task_id, completed, ticket);
                }
                Err(err) => {
                    let _ = ticket.send(Err(err));
                }
            },
            Command::WriteSettled {
                rollback,
                kind,
                entity_id,
                outcome,
                ticket,
            } => self.settle_write(rollback, kind, &entity_id, outcome, ticket),
        }
        true
    }

    fn handle_sync(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::Tasks { generation, push } => {
                if !self.sync.is_current_task_generation(generation) {
                    debug!(generation, "dropping stale task snapshot");
                    return;
                }
                match push {
                    Err(err) => {
                        warn!(error = %err, "task subscription transport error");
                        self.set_offline(true);
                    }
                    Ok(event) => {
                        self.set_offline(event.from_cache);
                        let tasks = normalize_tasks(event.docs);
                        let before: HashSet<String> =
                            self.cache.tasks().map(|t| t.id.clone()).collect();
                        self.cache.apply_task_snapshot(tasks);
                        for id in before {
                            if self.cache.contains_task(&id) {
                                // Snapshot is authoritative for this task;
                                // pending rollbacks against it are moot.
                                self.coordinator.retire(&EntityKey::Task(id));
                            } else {
                                self.sync.unsubscribe_subtasks(&id);
                                self.coordinator.forget(&id);
                                self.subtask_rows.remove(&id);
                            }
                        }
                        self.refresh_rows();
                    }
                }
            }
            SyncMessage::Subtasks {
                task_id,
                generation,
                push,
            } => {
                if !self.sync.is_current_subtask_generation(&task_id, generation) {
                    debug!(%task_id, generation, "dropping stale subtask snapshot");
                    return;
                }
                match push {
                    Err(err) => {
                        warn!(%task_id, error = %err, "subtask subscription transport error");
                        self.set_offline(true);
                    }
                    Ok(event) => {
                        self.set_offline(event.from_cache);
                        let subs = normalize_subtasks(&task_id, event.docs);
                        self.cache.apply_subtask_snapshot(&task_id, subs);
                        self.coordinator
                            .retire(&EntityKey::SubtaskList(task_id.clone()));
                        self.refresh_subtasks(&task_id);
                    }
                }
            }
        }
    }

    // --- operations ---

    fn add_task(&mut self, draft: TaskDraft, ticket: Ticket) {
        if draft.description.trim().is_empty() {
            let _ = ticket.send(Err(SyncError::EmptyDescription));
            return;
        }
        // Creation is confirm-then-project: the store assigns the id and
        // the subscription snapshot delivers the new task, so no optimistic
        // insert (and no provisional id) is needed.
        let fields = serde_json::json!({
            "owner_id": self.config.owner_id,
            "description": draft.description,
            "due_at": draft.due_at,
            "completed": false,
            "expanded": false,
            "reminder_at": draft.reminder.reminder_at(draft.due_at),
        });
        let store = self.store.clone();
        tokio::spawn(async move {
            let outcome = store
                .create_task(fields)
                .await
                .map(|_id| ())
                .map_err(|err| err.into_sync_error(EntityKind::Task, "<new>"));
            let _ = ticket.send(outcome);
        });
    }

    fn edit_task(&mut self, task_id: &str, edit: TaskEdit, ticket: Ticket) {
        if edit.description.trim().is_empty() {
            let _ = ticket.send(Err(SyncError::EmptyDescription));
            return;
        }
        if !self.cache.contains_task(task_id) {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        }
        let rollback = self.begin_task_rollback(task_id);
        self.cache
            .edit_task(task_id, edit.description.clone(), edit.due_at);
        self.refresh_rows();

        let fields = serde_json::json!({
            "description": edit.description,
            "due_at": edit.due_at,
        });
        let store = self.store.clone();
        let id = task_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Task,
            task_id.to_string(),
            ticket,
            async move { store.update_task(&id, fields).await },
        );
    }

    fn delete_task(&mut self, task_id: &str, ticket: Ticket) {
        if !self.cache.contains_task(task_id) {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        }
        // Deletion touches both the task and its cached subtask list, so
        // both rollback parts are captured, each under its own counter.
        let mut rollback = self.begin_task_rollback(task_id);
        let list_seq = self
            .coordinator
            .begin(&EntityKey::SubtaskList(task_id.to_string()));
        rollback.subtasks = Some((list_seq, self.cache.subtask_list_state(task_id)));
        self.cache.remove_task(task_id);
        self.sync.unsubscribe_subtasks(task_id);
        self.subtask_rows.remove(task_id);
        self.refresh_rows();

        let store = self.store.clone();
        let id = task_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Task,
            task_id.to_string(),
            ticket,
            async move { store.delete_task(&id).await },
        );
    }

    fn toggle_task_completion(&mut self, task_id: &str, completed: bool, ticket: Ticket) {
        if !self.cache.contains_task(task_id) {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        }
        if completed && !self.cache.is_loaded(task_id) {
            // The invariant needs the subtask list; fetch it once, then
            // re-enter through SubtasksFetched.
            let store = self.store.clone();
            let tx = self.cmd_tx.clone();
            let id = task_id.to_string();
            tokio::spawn(async move {
                let fetched = match store.fetch_subtasks(&id).await {
                    Ok(event) => Ok(normalize_subtasks(&id, event.docs)),
                    Err(StoreError::Unavailable(_)) => Err(SyncError::TransientConnectivity),
                    Err(err) => Err(err.into_sync_error(EntityKind::Task, &id)),
                };
                let _ = tx.send(Command::SubtasksFetched {
                    task_id: id,
                    completed,
                    fetched,
                    ticket,
                });
            });
            return;
        }
        self.complete_task_checked(task_id, completed, ticket);
    }

    /// Completion toggle with the subtask list already materialized.
    fn complete_task_checked(&mut self, task_id: &str, completed: bool, ticket: Ticket) {
        let Some(task) = self.cache.task(task_id) else {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        };
        let effects = match rules::set_task_completion(task, completed, self.cache.subtasks_of(task_id)) {
            Ok(effects) => effects,
            Err(err) => {
                let _ = ticket.send(Err(err));
                return;
            }
        };

        let mut rollback = self.begin_task_rollback(task_id);
        if !effects.force_complete.is_empty() {
            // The defensive cascade also touches the subtask list.
            let list_seq = self
                .coordinator
                .begin(&EntityKey::SubtaskList(task_id.to_string()));
            rollback.subtasks = Some((list_seq, self.cache.subtask_list_state(task_id)));
        }
        self.cache.set_task_completion(task_id, effects.completed);
        self.cache
            .force_subtasks_complete(task_id, &effects.force_complete);
        self.refresh_rows();
        self.refresh_subtasks(task_id);

        let store = self.store.clone();
        let id = task_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Task,
            task_id.to_string(),
            ticket,
            async move {
                store
                    .complete_task(&id, effects.completed, &effects.force_complete)
                    .await
            },
        );
    }

    async fn toggle_expanded(&mut self, task_id: &str, ticket: Ticket) {
        let Some(task) = self.cache.task(task_id) else {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        };
        let expanded = !task.expanded;

        let rollback = self.begin_task_rollback(task_id);
        self.cache.set_expanded(task_id, expanded);
        self.refresh_rows();

        // Unfolding a task materializes its subtask list.
        if expanded && !self.sync.has_subtask_subscription(task_id) {
            if let Err(err) = self.sync.subscribe_subtasks(task_id).await {
                warn!(%task_id, error = %err, "subtask subscription failed");
                self.set_offline(true);
            }
        }

        let fields = serde_json::json!({ "expanded": expanded });
        let store = self.store.clone();
        let id = task_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Task,
            task_id.to_string(),
            ticket,
            async move { store.update_task(&id, fields).await },
        );
    }

    async fn add_subtask(&mut self, task_id: &str, description: &str, ticket: Ticket) {
        if description.trim().is_empty() {
            let _ = ticket.send(Err(SyncError::EmptyDescription));
            return;
        }
        let Some(task) = self.cache.task(task_id) else {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        };

        // Unfold a collapsed task when its first subtask arrives, so the
        // new row is visible.
        if self.config.auto_expand_on_subtask_add
            && !task.expanded
            && self.cache.subtasks_of(task_id).is_empty()
        {
            let rollback = self.begin_task_rollback(task_id);
            self.cache.set_expanded(task_id, true);
            self.refresh_rows();
            let (_discard, expand_ticket) = mutation_ticket();
            let store = self.store.clone();
            let id = task_id.to_string();
            self.spawn_settling(
                rollback,
                EntityKind::Task,
                task_id.to_string(),
                expand_ticket,
                async move {
                    store
                        .update_task(&id, serde_json::json!({ "expanded": true }))
                        .await
                },
            );
        }

        // The created subtask arrives confirm-then-project through the
        // subscription.
        if !self.sync.has_subtask_subscription(task_id) {
            if let Err(err) = self.sync.subscribe_subtasks(task_id).await {
                warn!(%task_id, error = %err, "subtask subscription failed");
                self.set_offline(true);
            }
        }

        let fields = serde_json::json!({
            "description": description,
            "completed": false,
        });
        let store = self.store.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            let outcome = store
                .create_subtask(&id, fields)
                .await
                .map(|_sub_id| ())
                .map_err(|err| err.into_sync_error(EntityKind::Task, &id));
            let _ = ticket.send(outcome);
        });
    }

    fn delete_subtask(&mut self, task_id: &str, subtask_id: &str, ticket: Ticket) {
        if !self.cache.contains_task(task_id) {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        }
        if self.cache.is_loaded(task_id)
            && !self
                .cache
                .subtasks_of(task_id)
                .iter()
                .any(|sub| sub.id == subtask_id)
        {
            let _ = ticket.send(Err(SyncError::subtask_not_found(subtask_id)));
            return;
        }
        let rollback = self.begin_subtask_rollback(task_id);
        self.cache.remove_subtask(task_id, subtask_id);
        self.refresh_subtasks(task_id);

        let store = self.store.clone();
        let id = task_id.to_string();
        let sub_id = subtask_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Subtask,
            subtask_id.to_string(),
            ticket,
            async move { store.delete_subtask(&id, &sub_id).await },
        );
    }

    fn toggle_subtask_completion(
        &mut self,
        task_id: &str,
        subtask_id: &str,
        completed: bool,
        ticket: Ticket,
    ) {
        if !self.cache.contains_task(task_id) {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        }
        let rollback = self.begin_subtask_rollback(task_id);
        self.cache
            .set_subtask_completion(task_id, subtask_id, completed);
        self.refresh_subtasks(task_id);

        let fields = serde_json::json!({ "completed": completed });
        let store = self.store.clone();
        let id = task_id.to_string();
        let sub_id = subtask_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Subtask,
            subtask_id.to_string(),
            ticket,
            async move { store.update_subtask(&id, &sub_id, fields).await },
        );
    }

    fn edit_subtask_description(
        &mut self,
        task_id: &str,
        subtask_id: &str,
        description: &str,
        ticket: Ticket,
    ) {
        if description.trim().is_empty() {
            let _ = ticket.send(Err(SyncError::EmptyDescription));
            return;
        }
        if !self.cache.contains_task(task_id) {
            let _ = ticket.send(Err(SyncError::task_not_found(task_id)));
            return;
        }
        let rollback = self.begin_subtask_rollback(task_id);
        self.cache
            .edit_subtask_description(task_id, subtask_id, description.to_string());
        self.refresh_subtasks(task_id);

        let fields = serde_json::json!({ "description": description });
        let store = self.store.clone();
        let id = task_id.to_string();
        let sub_id = subtask_id.to_string();
        self.spawn_settling(
            rollback,
            EntityKind::Subtask,
            subtask_id.to_string(),
            ticket,
            async move { store.update_subtask(&id, &sub_id, fields).await },
        );
    }

    async fn load_subtasks(&mut self, task_id: &str) -> Result<(), SyncError> {
        if !self.cache.contains_task(task_id) {
            return Err(SyncError::task_not_found(task_id));
        }
        if self.sync.has_subtask_subscription(task_id) {
            return Ok(());
        }
        self.sync.subscribe_subtasks(task_id).await
    }

    // --- write settlement ---

    /// Open a task-level mutation: bump the task's counter and capture only
    /// its own fields.
    fn begin_task_rollback(&mut self, task_id: &str) -> Rollback {
        let seq = self.coordinator.begin(&EntityKey::Task(task_id.to_string()));
        Rollback {
            task_id: task_id.to_string(),
            task: Some((seq, self.cache.task_fields_state(task_id))),
            subtasks: None,
        }
    }

    /// Open a subtask-list mutation: bump the list's counter and capture
    /// only the cached list.
    fn begin_subtask_rollback(&mut self, task_id: &str) -> Rollback {
        let seq = self
            .coordinator
            .begin(&EntityKey::SubtaskList(task_id.to_string()));
        Rollback {
            task_id: task_id.to_string(),
            task: None,
            subtasks: Some((seq, self.cache.subtask_list_state(task_id))),
        }
    }

    fn settle_write(
        &mut self,
        rollback: Rollback,
        kind: EntityKind,
        entity_id: &str,
        outcome: Result<(), StoreError>,
        ticket: Ticket,
    ) {
        match outcome {
            Ok(()) => {
                let _ = ticket.send(Ok(()));
            }
            Err(err) => {
                warn!(%entity_id, error = %err, "remote write failed");
                let Rollback {
                    task_id,
                    task,
                    subtasks,
                } = rollback;
                if matches!(err, StoreError::NotFound(_)) {
                    // Deleted elsewhere: reconcile by removal, not rollback.
                    match kind {
                        EntityKind::Task => {
                            self.cache.remove_task(&task_id);
                            self.sync.unsubscribe_subtasks(&task_id);
                            self.coordinator.forget(&task_id);
                            self.subtask_rows.remove(&task_id);
                            self.refresh_rows();
                        }
                        EntityKind::Subtask => {
                            self.cache.remove_subtask(&task_id, entity_id);
                            self.refresh_subtasks(&task_id);
                        }
                    }
                } else {
                    // Each captured part is restored independently, and only
                    // while no newer mutation has touched that entity.
                    let mut restored = false;
                    if let Some((seq, state)) = task {
                        if self
                            .coordinator
                            .is_current(&EntityKey::Task(task_id.clone()), seq)
                        {
                            self.cache.restore_task_fields(state);
                            restored = true;
                        }
                    }
                    if let Some((seq, state)) = subtasks {
                        if self.cache.contains_task(&task_id)
                            && self
                                .coordinator
                                .is_current(&EntityKey::SubtaskList(task_id.clone()), seq)
                        {
                            self.cache.restore_subtask_list(state);
                            restored = true;
                        }
                    }
                    if restored {
                        self.refresh_rows();
                        self.refresh_subtasks(&task_id);
                    }
                }
                let _ = ticket.send(Err(err.into_sync_error(kind, entity_id)));
            }
        }
    }

    fn spawn_settling<F>(
        &self,
        rollback: Rollback,
        kind: EntityKind,
        entity_id: String,
        ticket: Ticket,
        write: F,
    ) where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = write.await;
            let _ = tx.send(Command::WriteSettled {
                rollback,
                kind,
                entity_id,
                outcome,
                ticket,
            });
        });
    }

    // --- projection publishing ---

    fn refresh_rows(&mut self) {
        let tasks: Vec<Task> = self.cache.tasks().cloned().collect();
        let new_rows = build_display_rows(
            &tasks,
            &self.view,
            &self.config.date_header_format,
            &self.config.undated_label,
        );
        let ops = reconcile(&self.rows, &new_rows);
        self.rows = new_rows;
        if !ops.is_empty() {
            let _ = self.events.send(EngineEvent::RowsChanged { ops });
        }
        let progress = progress_of(&self.rows);
        if progress != self.progress {
            self.progress = progress;
            let _ = self.events.send(EngineEvent::ProgressChanged { progress });
        }
        self.publish();
    }

    fn refresh_subtasks(&mut self, task_id: &str) {
        let new_list = self.cache.subtasks_of(task_id).to_vec();
        let old_list = self
            .subtask_rows
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let ops = reconcile(old_list, &new_list);
        if self.cache.contains_task(task_id) {
            self.subtask_rows.insert(task_id.to_string(), new_list);
        } else {
            self.subtask_rows.remove(task_id);
        }
        if !ops.is_empty() {
            let _ = self.events.send(EngineEvent::SubtasksChanged {
                task_id: task_id.to_string(),
                ops,
            });
        }
        self.publish();
    }

    fn publish(&self) {
        self.published.store(Arc::new(ProjectionSnapshot {
            rows: self.rows.clone(),
            progress: self.progress,
            subtasks: self.subtask_rows.clone(),
        }));
    }

    fn set_offline(&mut self, offline: bool) {
        if self.offline != offline {
            self.offline = offline;
            let _ = self.events.send(EngineEvent::Connectivity { offline });
        }
    }
}
