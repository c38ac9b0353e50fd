//! Task Scheduler
//!
//! Executes long-running operations as cancellable background jobs on a
//! fixed-size worker pool.
//!
//! # Execution model
//!
//! ```text
//!   submit ──▶ per-target FIFO ──▶ worker slot ──▶ attempt (watchdog)
//!                                                   │ transient error
//!                                                   ├──▶ backoff, retry
//!                                                   ▼
//!                             completion ──▶ commit/rollback (ack) ──▶ terminal
//! ```
//!
//! Entity mutation is never done by a job itself: the outcome is sent over
//! the completion channel and the task only becomes terminal once the
//! receiver acknowledged the commit or rollback. Shutdown interrupts jobs
//! without marking them terminal so they are resumed after a restart.

use crate::config::SchedulerConfig;
use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::ports::StorageBackend;
use crate::domain::types::TaskId;
use crate::error::{Error, Result};
use crate::scheduler::task::{
    Task, TaskContext, TaskEntry, TaskFilter, TaskHandle, TaskOperation, TaskOutcome, TaskState,
    TaskTarget,
};
use crate::store::{self, MetadataStore, RecordKind};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

// =============================================================================
// Completion Channel
// =============================================================================

/// Outcome of a finished job, awaiting commit or rollback
#[derive(Debug)]
pub struct TaskCompletion {
    pub task: Task,
    pub outcome: TaskOutcome,
    ack: oneshot::Sender<()>,
}

impl TaskCompletion {
    /// Confirm the entity was committed or rolled back
    pub fn acknowledge(self) {
        let _ = self.ack.send(());
    }
}

/// Receiving side of the completion channel
pub type CompletionReceiver = mpsc::UnboundedReceiver<TaskCompletion>;

// =============================================================================
// Task Scheduler
// =============================================================================

/// Background task scheduler
pub struct TaskScheduler {
    config: SchedulerConfig,
    backend: Arc<dyn StorageBackend>,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    /// Per-target FIFO; the front task is the active one
    queues: Mutex<HashMap<TaskTarget, VecDeque<TaskId>>>,
    /// Bumped whenever a queue front changes
    queue_turn: watch::Sender<u64>,
    permits: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<TaskCompletion>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.config.worker_count)
            .field("tasks", &self.tasks.len())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl TaskScheduler {
    /// Start a scheduler; the caller owns the completion receiver
    pub fn start(
        config: SchedulerConfig,
        backend: Arc<dyn StorageBackend>,
        store: Arc<dyn MetadataStore>,
        events: EventBus,
    ) -> (Arc<Self>, CompletionReceiver) {
        let (completions, receiver) = mpsc::unbounded_channel();
        let (queue_turn, _) = watch::channel(0);

        info!(
            "Task scheduler started ({} workers, backend {})",
            config.worker_count,
            backend.name()
        );

        let scheduler = Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.worker_count.max(1))),
            config,
            backend,
            store,
            events,
            tasks: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            queue_turn,
            completions,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        (scheduler, receiver)
    }

    /// Stop accepting work and wait for every job to stop
    pub async fn shutdown(&self) {
        info!("Shutting down task scheduler");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Task scheduler stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a new task
    pub fn submit(self: &Arc<Self>, operation: TaskOperation) -> Result<TaskHandle> {
        self.enqueue(Task::new(operation))
    }

    /// Re-queue a persisted task that was interrupted by a restart
    ///
    /// The task keeps its identifier, retry count and checkpoint, so the
    /// backend resumes after the last committed step.
    pub fn resume(self: &Arc<Self>, mut task: Task) -> Result<TaskHandle> {
        if task.state.is_terminal() {
            return Err(Error::InvalidState {
                entity: format!("task/{}", task.id),
                reason: format!("cannot resume a {} task", task.state),
            });
        }
        info!(
            "Resuming task {} ({}) from checkpoint {:?}",
            task.id, task.kind, task.checkpoint
        );
        task.state = TaskState::Queued;
        self.enqueue(task)
    }

    /// Keep a finished task from a previous run queryable
    pub fn adopt_terminal(&self, task: Task) {
        if task.state.is_terminal() {
            let id = task.id.clone();
            self.tasks
                .insert(id, Arc::new(TaskEntry::new(task, CancellationToken::new())));
        }
    }

    fn enqueue(self: &Arc<Self>, task: Task) -> Result<TaskHandle> {
        if self.is_shut_down() {
            return Err(Error::Internal("task scheduler is shut down".into()));
        }

        let id = task.id.clone();
        let target = task.target.clone();
        let kind = task.kind;
        store::persist(&*self.store, RecordKind::Task, id.as_str(), &task);

        let entry = Arc::new(TaskEntry::new(task, self.shutdown.child_token()));
        let handle = TaskHandle::new(id.clone(), entry.snapshot.subscribe());
        self.tasks.insert(id.clone(), entry.clone());
        let position = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(target.clone()).or_default();
            queue.push_back(id.clone());
            queue.len()
        };

        self.events.publish(StorageEvent::TaskStateChanged {
            task: id.clone(),
            kind,
            state: TaskState::Queued,
        });
        info!(
            "Task {} ({}) queued on {} at position {}",
            id, kind, target, position
        );

        let scheduler = self.clone();
        self.tracker.spawn(async move { scheduler.run(entry).await });

        Ok(handle)
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Request cooperative cancellation
    pub fn cancel(&self, id: &TaskId) -> Result<Task> {
        let entry = self.entry(id)?;
        let task = entry.task();
        if task.state.is_terminal() {
            return Err(Error::InvalidState {
                entity: format!("task/{}", id),
                reason: format!("task already {}", task.state),
            });
        }
        info!("Cancellation requested for task {} ({})", id, task.kind);
        entry.cancel.cancel();
        Ok(task)
    }

    /// Pause a task at its next checkpoint; it keeps its target slot
    pub fn pause(&self, id: &TaskId) -> Result<Task> {
        let entry = self.entry(id)?;
        let task = entry.task();
        match task.state {
            TaskState::Queued | TaskState::Running => {}
            TaskState::Paused => return Ok(task),
            state => {
                return Err(Error::InvalidState {
                    entity: format!("task/{}", id),
                    reason: format!("cannot pause a {} task", state),
                })
            }
        }

        entry.pause.send_replace(true);
        let paused_now = entry.snapshot.send_if_modified(|t| {
            if t.state == TaskState::Queued {
                t.state = TaskState::Paused;
                true
            } else {
                false
            }
        });
        if paused_now {
            self.record(&entry);
        }
        info!("Task {} paused", id);
        Ok(entry.task())
    }

    /// Resume a paused task
    pub fn resume_paused(&self, id: &TaskId) -> Result<Task> {
        let entry = self.entry(id)?;
        let task = entry.task();
        if task.state.is_terminal() {
            return Err(Error::InvalidState {
                entity: format!("task/{}", id),
                reason: format!("task already {}", task.state),
            });
        }

        entry.pause.send_replace(false);
        let requeued = entry.snapshot.send_if_modified(|t| {
            if t.state == TaskState::Paused && t.started_at.is_none() {
                t.state = TaskState::Queued;
                true
            } else {
                false
            }
        });
        if requeued {
            self.record(&entry);
        }
        info!("Task {} resumed", id);
        Ok(entry.task())
    }

    /// Fail every pending task of a target that can no longer be served
    pub fn fail_target(&self, target: &TaskTarget, reason: &str) -> usize {
        let ids: Vec<TaskId> = self
            .queues
            .lock()
            .get(target)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();

        for id in &ids {
            if let Some(entry) = self.tasks.get(id) {
                *entry.failure.lock() = Some(reason.to_string());
                entry.cancel.cancel();
            }
        }
        if !ids.is_empty() {
            warn!("Failing {} task(s) on {}: {}", ids.len(), target, reason);
        }
        ids.len()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        Ok(self.entry(id)?.task())
    }

    /// Tracking handle for an existing task
    pub fn handle(&self, id: &TaskId) -> Result<TaskHandle> {
        let entry = self.entry(id)?;
        Ok(TaskHandle::new(id.clone(), entry.snapshot.subscribe()))
    }

    /// Wait for a task to reach a terminal state
    pub async fn wait(&self, id: &TaskId) -> Result<Task> {
        self.handle(id)?.wait().await
    }

    /// Tasks matching a filter, oldest first
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|e| e.value().task())
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Non-terminal tasks of a target, in queue order
    pub fn active_tasks(&self, target: &TaskTarget) -> Vec<Task> {
        let ids: Vec<TaskId> = self
            .queues
            .lock()
            .get(target)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.tasks.get(id).map(|e| e.task()))
            .collect()
    }

    pub fn has_active(&self, target: &TaskTarget) -> bool {
        self.queues
            .lock()
            .get(target)
            .map_or(false, |q| !q.is_empty())
    }

    fn entry(&self, id: &TaskId) -> Result<Arc<TaskEntry>> {
        self.tasks
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("task", id))
    }

    // =========================================================================
    // Job Execution
    // =========================================================================

    async fn run(self: Arc<Self>, entry: Arc<TaskEntry>) {
        let id = entry.task().id;
        match self.execute(&entry).await {
            Some(outcome) => self.finish(&entry, outcome).await,
            None => debug!("Task {} interrupted by shutdown", id),
        }
    }

    /// Run the job up to its outcome; `None` means interrupted by shutdown
    async fn execute(&self, entry: &Arc<TaskEntry>) -> Option<TaskOutcome> {
        let task = entry.task();

        if self.wait_turn(&task.id, &task.target, entry).await.is_err() {
            return self.interrupted(entry);
        }

        if entry.is_paused() && entry.wait_unpaused().await.is_err() {
            return self.interrupted(entry);
        }

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok()?,
            _ = entry.cancel.cancelled() => return self.interrupted(entry),
        };

        entry.snapshot.send_modify(|t| {
            t.state = TaskState::Running;
            t.started_at.get_or_insert_with(Utc::now);
        });
        self.record(entry);
        info!("Task {} ({}) running on {}", task.id, task.kind, task.target);

        let outcome = self.attempts(entry).await;
        drop(permit);
        outcome
    }

    /// Wait until the task is at the front of its target queue
    async fn wait_turn(&self, id: &TaskId, target: &TaskTarget, entry: &TaskEntry) -> Result<()> {
        let mut turn = self.queue_turn.subscribe();
        loop {
            let at_front = self
                .queues
                .lock()
                .get(target)
                .and_then(|q| q.front())
                .map_or(false, |front| front == id);
            if at_front {
                return Ok(());
            }

            tokio::select! {
                changed = turn.changed() => changed.map_err(|_| Error::Cancelled)?,
                _ = entry.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    async fn attempts(&self, entry: &Arc<TaskEntry>) -> Option<TaskOutcome> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff(),
            max_interval: self.config.max_backoff(),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            let ctx = TaskContext::new(entry.clone(), self.store.clone(), self.events.clone());
            let error = match self.attempt(entry, &ctx).await {
                Ok(()) => return Some(TaskOutcome::Succeeded),
                Err(e) => e,
            };

            if entry.cancel.is_cancelled() {
                return self.interrupted(entry);
            }

            let task = entry.task();
            if error.is_transient() && task.retry_count < self.config.max_retries {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.config.max_backoff());
                warn!(
                    "Task {} attempt {} failed: {} (retrying in {:?})",
                    task.id,
                    task.retry_count + 1,
                    error,
                    delay
                );
                entry.snapshot.send_modify(|t| {
                    t.retry_count += 1;
                    t.error = Some(error.to_string());
                });
                store::persist(&*self.store, RecordKind::Task, task.id.as_str(), &entry.task());

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = entry.cancel.cancelled() => return self.interrupted(entry),
                }
                continue;
            }

            warn!(
                "Task {} ({}) failed after {} retries: {}",
                task.id, task.kind, task.retry_count, error
            );
            return Some(TaskOutcome::Failed(error.to_string()));
        }
    }

    /// One attempt under the watchdog
    ///
    /// A stalled attempt is dropped when its deadline passes, which frees
    /// the worker slot. Time spent paused does not count.
    async fn attempt(&self, entry: &TaskEntry, ctx: &TaskContext) -> Result<()> {
        let timeout = self.config.attempt_timeout();
        let operation = entry.task().operation;
        let work = dispatch(&*self.backend, &operation, ctx);
        tokio::pin!(work);

        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = tokio::time::sleep_until(deadline) => {
                    if entry.is_paused() {
                        deadline = Instant::now() + timeout;
                        continue;
                    }
                    warn!(
                        "Task {} attempt exceeded {:?}, reclaiming worker slot",
                        ctx.task_id(),
                        timeout
                    );
                    return Err(Error::AttemptTimeout {
                        secs: timeout.as_secs(),
                    });
                }
            }
        }
    }

    /// Outcome of a job whose cancellation token fired
    fn interrupted(&self, entry: &TaskEntry) -> Option<TaskOutcome> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        match entry.failure.lock().clone() {
            Some(reason) => Some(TaskOutcome::Failed(reason)),
            None => Some(TaskOutcome::Cancelled),
        }
    }

    /// Hand the outcome to the commit step, then publish the terminal state
    async fn finish(&self, entry: &TaskEntry, outcome: TaskOutcome) {
        let task = entry.task();
        let (ack, acked) = oneshot::channel();
        let completion = TaskCompletion {
            task: task.clone(),
            outcome: outcome.clone(),
            ack,
        };

        if self.completions.send(completion).is_ok() {
            tokio::select! {
                _ = acked => {}
                _ = self.shutdown.cancelled() => {
                    debug!("Task {} commit interrupted by shutdown", task.id);
                    return;
                }
            }
        }

        entry.snapshot.send_modify(|t| {
            t.state = outcome.state();
            t.finished_at = Some(Utc::now());
            match &outcome {
                TaskOutcome::Succeeded => {
                    t.progress = 1.0;
                    t.error = None;
                }
                TaskOutcome::Failed(reason) => t.error = Some(reason.clone()),
                TaskOutcome::Cancelled => {}
            }
        });
        self.record(entry);

        match &outcome {
            TaskOutcome::Succeeded => info!("Task {} ({}) succeeded", task.id, task.kind),
            TaskOutcome::Failed(reason) => {
                warn!("Task {} ({}) failed: {}", task.id, task.kind, reason)
            }
            TaskOutcome::Cancelled => info!("Task {} ({}) cancelled", task.id, task.kind),
        }

        self.leave_queue(&task.target, &task.id);
    }

    fn leave_queue(&self, target: &TaskTarget, id: &TaskId) {
        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get_mut(target) {
                queue.retain(|queued| queued != id);
                if queue.is_empty() {
                    queues.remove(target);
                }
            }
        }
        self.queue_turn.send_modify(|turn| *turn += 1);
    }

    /// Persist the current snapshot and publish its state
    fn record(&self, entry: &TaskEntry) {
        let task = entry.task();
        store::persist(&*self.store, RecordKind::Task, task.id.as_str(), &task);
        self.events.publish(StorageEvent::TaskStateChanged {
            task: task.id,
            kind: task.kind,
            state: task.state,
        });
    }
}

/// Route an operation to the backend
async fn dispatch(
    backend: &dyn StorageBackend,
    operation: &TaskOperation,
    ctx: &TaskContext,
) -> Result<()> {
    match operation {
        TaskOperation::PoolCreate { pool, groups } => backend.initialize_pool(pool, groups, ctx).await,
        TaskOperation::PoolExpand { pool, groups } => backend.expand_pool(pool, groups, ctx).await,
        TaskOperation::GroupRebuild { group, slot, disk } => {
            backend.rebuild_member(group, *slot, disk, ctx).await
        }
        TaskOperation::GroupScrub { group } => backend.scrub_group(group, ctx).await,
        TaskOperation::VolumeCreate {
            volume,
            pool,
            size_bytes,
        } => backend.format_volume(volume, pool, *size_bytes, ctx).await,
        TaskOperation::VolumeResize {
            volume,
            pool,
            from_bytes,
            to_bytes,
        } => {
            backend
                .resize_volume(volume, pool, *from_bytes, *to_bytes, ctx)
                .await
        }
        TaskOperation::VolumeDelete { volume, pool } => {
            backend.destroy_volume(volume, pool, ctx).await
        }
    }
}
