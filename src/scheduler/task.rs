//! Task Model
//!
//! Long-running operations, their targets, lifecycle states and the
//! execution context handed to the storage backend.

use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::types::{DiskId, GroupId, PoolId, TaskId, VolumeId};
use crate::error::{Error, Result};
use crate::store::{self, MetadataStore, RecordKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Kinds, States & Targets
// =============================================================================

/// Kind of long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PoolCreate,
    PoolExpand,
    GroupRebuild,
    GroupScrub,
    VolumeCreate,
    VolumeResize,
    VolumeDelete,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::PoolCreate,
        TaskKind::PoolExpand,
        TaskKind::GroupRebuild,
        TaskKind::GroupScrub,
        TaskKind::VolumeCreate,
        TaskKind::VolumeResize,
        TaskKind::VolumeDelete,
    ];
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::PoolCreate => write!(f, "pool_create"),
            TaskKind::PoolExpand => write!(f, "pool_expand"),
            TaskKind::GroupRebuild => write!(f, "group_rebuild"),
            TaskKind::GroupScrub => write!(f, "group_scrub"),
            TaskKind::VolumeCreate => write!(f, "volume_create"),
            TaskKind::VolumeResize => write!(f, "volume_resize"),
            TaskKind::VolumeDelete => write!(f, "volume_delete"),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Queued,
        TaskState::Running,
        TaskState::Paused,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Paused => write!(f, "paused"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Entity a task operates on; at most one task per target is active
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum TaskTarget {
    Group(GroupId),
    Pool(PoolId),
    Volume(VolumeId),
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskTarget::Group(id) => write!(f, "group/{}", id),
            TaskTarget::Pool(id) => write!(f, "pool/{}", id),
            TaskTarget::Volume(id) => write!(f, "volume/{}", id),
        }
    }
}

/// Parameters of a task, as needed by the backend and by the commit step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskOperation {
    PoolCreate {
        pool: PoolId,
        groups: Vec<GroupId>,
    },
    PoolExpand {
        pool: PoolId,
        groups: Vec<GroupId>,
    },
    GroupRebuild {
        group: GroupId,
        slot: usize,
        disk: DiskId,
    },
    GroupScrub {
        group: GroupId,
    },
    VolumeCreate {
        volume: VolumeId,
        pool: PoolId,
        size_bytes: u64,
    },
    VolumeResize {
        volume: VolumeId,
        pool: PoolId,
        from_bytes: u64,
        to_bytes: u64,
    },
    VolumeDelete {
        volume: VolumeId,
        pool: PoolId,
    },
}

impl TaskOperation {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskOperation::PoolCreate { .. } => TaskKind::PoolCreate,
            TaskOperation::PoolExpand { .. } => TaskKind::PoolExpand,
            TaskOperation::GroupRebuild { .. } => TaskKind::GroupRebuild,
            TaskOperation::GroupScrub { .. } => TaskKind::GroupScrub,
            TaskOperation::VolumeCreate { .. } => TaskKind::VolumeCreate,
            TaskOperation::VolumeResize { .. } => TaskKind::VolumeResize,
            TaskOperation::VolumeDelete { .. } => TaskKind::VolumeDelete,
        }
    }

    pub fn target(&self) -> TaskTarget {
        match self {
            TaskOperation::PoolCreate { pool, .. } | TaskOperation::PoolExpand { pool, .. } => {
                TaskTarget::Pool(pool.clone())
            }
            TaskOperation::GroupRebuild { group, .. } | TaskOperation::GroupScrub { group } => {
                TaskTarget::Group(group.clone())
            }
            TaskOperation::VolumeCreate { volume, .. }
            | TaskOperation::VolumeResize { volume, .. }
            | TaskOperation::VolumeDelete { volume, .. } => TaskTarget::Volume(volume.clone()),
        }
    }
}

// =============================================================================
// Task Record
// =============================================================================

/// A task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub operation: TaskOperation,
    pub target: TaskTarget,
    pub state: TaskState,
    /// Fraction in [0, 1], never decreasing
    pub progress: f64,
    pub retry_count: u32,
    /// Last committed backend step
    #[serde(default)]
    pub checkpoint: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(operation: TaskOperation) -> Self {
        Self {
            id: TaskId::generate(),
            kind: operation.kind(),
            target: operation.target(),
            operation,
            state: TaskState::Queued,
            progress: 0.0,
            retry_count: 0,
            checkpoint: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// How a task ended, as reported to the commit step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// Filter for task listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub state: Option<TaskState>,
    pub target: Option<TaskTarget>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.kind.map_or(true, |k| k == task.kind)
            && self.state.map_or(true, |s| s == task.state)
            && self.target.as_ref().map_or(true, |t| t == &task.target)
    }
}

// =============================================================================
// Runtime Entry, Handle & Context
// =============================================================================

/// Live state of one task inside the scheduler
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub(crate) snapshot: watch::Sender<Task>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pause: watch::Sender<bool>,
    /// Reason set when the task is failed from outside (target lost)
    pub(crate) failure: Mutex<Option<String>>,
}

impl TaskEntry {
    pub(crate) fn new(task: Task, cancel: CancellationToken) -> Self {
        let (snapshot, _) = watch::channel(task);
        let (pause, _) = watch::channel(false);
        Self {
            snapshot,
            cancel,
            pause,
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn task(&self) -> Task {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Wait until the pause flag is cleared or the task is cancelled
    pub(crate) async fn wait_unpaused(&self) -> Result<()> {
        let mut rx = self.pause.subscribe();
        tokio::select! {
            res = rx.wait_for(|paused| !*paused) => {
                res.map(|_| ()).map_err(|_| Error::Cancelled)
            }
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Tracking handle returned by every submission
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    updates: watch::Receiver<Task>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, updates: watch::Receiver<Task>) -> Self {
        Self { id, updates }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Current snapshot of the task
    pub fn snapshot(&self) -> Task {
        self.updates.borrow().clone()
    }

    /// Wait for the task to reach a terminal state
    pub async fn wait(mut self) -> Result<Task> {
        let task = self
            .updates
            .wait_for(|t| t.state.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("task {} was dropped", self.id)))?;
        Ok(task.clone())
    }
}

/// Execution context given to the backend for one attempt
///
/// Backends call [`TaskContext::checkpoint`] at I/O-safe points; that is
/// where cancellation and pause requests take effect.
#[derive(Clone)]
pub struct TaskContext {
    entry: Arc<TaskEntry>,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    resume_from: Option<u64>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.entry.snapshot.borrow().id)
            .field("resume_from", &self.resume_from)
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        entry: Arc<TaskEntry>,
        store: Arc<dyn MetadataStore>,
        events: EventBus,
    ) -> Self {
        let resume_from = entry.snapshot.borrow().checkpoint;
        Self {
            entry,
            store,
            events,
            resume_from,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.entry.snapshot.borrow().id.clone()
    }

    pub fn kind(&self) -> TaskKind {
        self.entry.snapshot.borrow().kind
    }

    /// Step after which work should resume (last committed checkpoint)
    pub fn resume_from(&self) -> Option<u64> {
        self.resume_from
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancel.is_cancelled()
    }

    /// Resolves once cancellation was requested
    pub async fn cancelled(&self) {
        self.entry.cancel.cancelled().await
    }

    /// Report progress; values below the current progress are ignored
    pub fn progress(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.entry.snapshot.send_if_modified(|task| {
            if fraction > task.progress {
                task.progress = fraction;
                true
            } else {
                false
            }
        });
    }

    /// Commit a step: record progress and checkpoint, then honor any
    /// pending cancellation or pause request
    pub async fn checkpoint(&self, step: u64, fraction: f64) -> Result<()> {
        self.progress(fraction);
        self.entry.snapshot.send_modify(|task| task.checkpoint = Some(step));
        let task = self.entry.task();
        store::persist(&*self.store, RecordKind::Task, task.id.as_str(), &task);

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if self.entry.is_paused() {
            debug!("Task {} paused at step {}", task.id, step);
            self.set_state(TaskState::Paused);
            self.entry.wait_unpaused().await?;
            self.set_state(TaskState::Running);
            debug!("Task {} resumed", task.id);
        }

        Ok(())
    }

    fn set_state(&self, state: TaskState) {
        self.entry.snapshot.send_modify(|task| task.state = state);
        let task = self.entry.task();
        store::persist(&*self.store, RecordKind::Task, task.id.as_str(), &task);
        self.events.publish(StorageEvent::TaskStateChanged {
            task: task.id,
            kind: task.kind,
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn context() -> (Arc<TaskEntry>, TaskContext) {
        let task = Task::new(TaskOperation::GroupScrub {
            group: GroupId::new("g1"),
        });
        let entry = Arc::new(TaskEntry::new(task, CancellationToken::new()));
        let ctx = TaskContext::new(entry.clone(), Arc::new(MemoryStore::new()), EventBus::new(8));
        (entry, ctx)
    }

    #[test]
    fn test_operation_target_and_kind() {
        let op = TaskOperation::VolumeResize {
            volume: VolumeId::new("vol-1"),
            pool: PoolId::new("pool-1"),
            from_bytes: 1,
            to_bytes: 2,
        };
        assert_eq!(op.kind(), TaskKind::VolumeResize);
        assert_eq!(op.target(), TaskTarget::Volume(VolumeId::new("vol-1")));
        assert_eq!(op.target().to_string(), "volume/vol-1");
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (entry, ctx) = context();
        ctx.progress(0.5);
        ctx.progress(0.2);
        assert_eq!(entry.task().progress, 0.5);
        ctx.progress(7.0);
        assert_eq!(entry.task().progress, 1.0);
    }

    #[tokio::test]
    async fn test_checkpoint_observes_cancellation() {
        let (entry, ctx) = context();
        ctx.checkpoint(1, 0.1).await.unwrap();
        entry.cancel.cancel();
        assert!(matches!(ctx.checkpoint(2, 0.2).await, Err(Error::Cancelled)));
        assert_eq!(entry.task().checkpoint, Some(2));
    }

    #[tokio::test]
    async fn test_checkpoint_waits_while_paused() {
        let (entry, ctx) = context();
        entry.pause.send_replace(true);

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.checkpoint(1, 0.5).await }
        });

        let mut updates = entry.snapshot.subscribe();
        updates
            .wait_for(|t| t.state == TaskState::Paused)
            .await
            .unwrap();

        entry.pause.send_replace(false);
        waiter.await.unwrap().unwrap();
        assert_eq!(entry.task().state, TaskState::Running);
    }

    #[test]
    fn test_filter() {
        let task = Task::new(TaskOperation::GroupScrub {
            group: GroupId::new("g1"),
        });
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter {
            kind: Some(TaskKind::GroupScrub),
            state: Some(TaskState::Queued),
            target: Some(TaskTarget::Group(GroupId::new("g1"))),
        }
        .matches(&task));
        assert!(!TaskFilter {
            state: Some(TaskState::Running),
            ..Default::default()
        }
        .matches(&task));
    }
}
