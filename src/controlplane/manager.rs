//! Storage Manager - the controller facade
//!
//! Wires the inventory, RAID engine, pool and volume managers, task
//! scheduler and health monitor together and owns the completion loop:
//! every finished task is routed to the component that commits or rolls
//! back its target entity before the task is published as terminal.
//!
//! Startup recovery order:
//! 1. disks, groups, pools and volumes are reloaded from the store
//! 2. non-terminal tasks are re-queued from their last checkpoint
//! 3. entities left mid-operation without a live task get it resubmitted

use crate::config::StorageConfig;
use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::ports::{DiskProbe, StorageBackend};
use crate::domain::types::{DiskId, GroupId, PoolId, TaskId, VolumeId};
use crate::error::{ErrorAction, Result};
use crate::hardware::{Disk, DiskInventory, HealthEvent, HealthMonitor, PollReport};
use crate::pool::{PoolManager, StoragePool};
use crate::raid::{RaidEngine, RaidLayout, RedundancyGroup};
use crate::scheduler::{
    CompletionReceiver, Task, TaskCompletion, TaskFilter, TaskHandle, TaskOperation, TaskOutcome,
    TaskScheduler,
};
use crate::store::{self, MetadataStore, RecordKind};
use crate::volume::{Volume, VolumeManager};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Counts from startup recovery
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub disks: usize,
    pub corrupt_groups: usize,
    pub failed_pools: usize,
    pub volumes: usize,
    pub resumed_tasks: usize,
    pub resubmitted_tasks: usize,
}

/// The storage controller
pub struct StorageManager {
    events: EventBus,
    store: Arc<dyn MetadataStore>,
    inventory: Arc<DiskInventory>,
    scheduler: Arc<TaskScheduler>,
    raid: Arc<RaidEngine>,
    pools: Arc<PoolManager>,
    volumes: Arc<VolumeManager>,
    health: Arc<HealthMonitor>,
    recovery: RecoveryReport,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("inventory", &self.inventory)
            .field("raid", &self.raid)
            .field("pools", &self.pools)
            .field("volumes", &self.volumes)
            .finish()
    }
}

impl StorageManager {
    /// Build the controller, restore persisted state and resume work
    pub async fn open(
        config: StorageConfig,
        backend: Arc<dyn StorageBackend>,
        probe: Arc<dyn DiskProbe>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            "Opening storage manager (backend {}, probe {})",
            backend.name(),
            probe.name()
        );

        let lock_timeout = config.lock_timeout();
        let events = EventBus::new(config.event_channel_capacity);
        let mut recovery = RecoveryReport::default();

        let inventory = DiskInventory::new(events.clone(), store.clone());
        recovery.disks = inventory.restore()?;

        let (scheduler, completions) = TaskScheduler::start(
            config.scheduler.clone(),
            backend,
            store.clone(),
            events.clone(),
        );

        let raid = RaidEngine::new(
            config.raid.clone(),
            lock_timeout,
            inventory.clone(),
            scheduler.clone(),
            events.clone(),
            store.clone(),
        );
        let corrupt_groups = raid.restore()?;
        recovery.corrupt_groups = corrupt_groups.len();

        let pools = PoolManager::new(
            config.pool.clone(),
            lock_timeout,
            raid.clone(),
            scheduler.clone(),
            events.clone(),
            store.clone(),
        );
        recovery.failed_pools = pools.restore(&corrupt_groups)?.len();

        let volumes = VolumeManager::new(
            config.volume.clone(),
            lock_timeout,
            pools.clone(),
            scheduler.clone(),
            events.clone(),
            store.clone(),
        );
        recovery.volumes = volumes.restore()?;

        let health = HealthMonitor::new(
            config.health.clone(),
            probe,
            inventory.clone(),
            raid.clone(),
            events.clone(),
        );

        let mut manager = Self {
            events,
            store,
            inventory,
            scheduler,
            raid,
            pools,
            volumes,
            health,
            recovery,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        manager.recovery.resumed_tasks = manager.resume_tasks()?;
        manager.recovery.resubmitted_tasks = manager.raid.resume_stalled_rebuilds()
            + manager.pools.resume_stalled()
            + manager.volumes.resume_stalled();

        let manager = Arc::new(manager);
        manager.spawn_completion_loop(completions);
        manager.spawn_pool_state_watcher();

        info!("Storage manager ready: {:?}", manager.recovery);
        Ok(manager)
    }

    /// Start periodic health polling
    pub fn start_health_monitor(&self) {
        let handle = self.health.spawn(self.shutdown.child_token());
        self.tracker.spawn(async move {
            if let Err(e) = handle.await {
                error!("Health monitor task ended abnormally: {}", e);
            }
        });
    }

    /// Stop background work; interrupted tasks resume on the next open
    pub async fn shutdown(&self) {
        info!("Shutting down storage manager");
        self.scheduler.shutdown().await;
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Storage manager stopped");
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    fn resume_tasks(&self) -> Result<usize> {
        let mut tasks = Vec::new();
        for (key, body) in self.store.load_all(RecordKind::Task)? {
            match store::decode::<Task>(RecordKind::Task, &key, &body) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task record: {}", e),
            }
        }
        tasks.sort_by_key(|t| t.created_at);

        let mut resumed = 0;
        for task in tasks {
            if task.state.is_terminal() {
                self.scheduler.adopt_terminal(task);
                continue;
            }
            let id = task.id.clone();
            match self.scheduler.resume(task) {
                Ok(_) => resumed += 1,
                Err(e) => warn!("Could not resume task {}: {}", id, e),
            }
        }
        Ok(resumed)
    }

    // =========================================================================
    // Background Loops
    // =========================================================================

    fn spawn_completion_loop(self: &Arc<Self>, mut completions: CompletionReceiver) {
        let manager = self.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    completion = completions.recv() => match completion {
                        Some(completion) => manager.commit(completion).await,
                        None => break,
                    },
                }
            }
            debug!("Completion loop stopped");
        });
    }

    /// Apply a finished task to its entity, retrying lock contention
    async fn commit(&self, completion: TaskCompletion) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..ExponentialBackoff::default()
        };

        loop {
            let error = match self.apply(&completion.task.operation, &completion.outcome) {
                Ok(()) => break,
                Err(e) => e,
            };
            match (error.action(), backoff.next_backoff()) {
                (ErrorAction::RetryByCaller, Some(delay)) => {
                    debug!(
                        "Commit of task {} contended, retrying in {:?}",
                        completion.task.id, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    error!(
                        "Could not commit task {} ({}): {}",
                        completion.task.id, completion.task.kind, error
                    );
                    break;
                }
            }
        }

        completion.acknowledge();
    }

    fn apply(&self, operation: &TaskOperation, outcome: &TaskOutcome) -> Result<()> {
        match operation {
            TaskOperation::PoolCreate { pool, .. } => self.pools.complete_create(pool, outcome),
            TaskOperation::PoolExpand { pool, groups } => {
                self.pools.complete_expand(pool, groups, outcome)
            }
            TaskOperation::GroupRebuild { group, slot, disk } => {
                self.raid.complete_rebuild(group, *slot, disk, outcome)
            }
            TaskOperation::GroupScrub { group } => self.raid.complete_scrub(group, outcome),
            TaskOperation::VolumeCreate { volume, .. } => {
                self.volumes.complete_create(volume, outcome)
            }
            TaskOperation::VolumeResize {
                volume, to_bytes, ..
            } => self.volumes.complete_resize(volume, *to_bytes, outcome),
            TaskOperation::VolumeDelete { volume, .. } => {
                self.volumes.complete_delete(volume, outcome)
            }
        }
    }

    /// Publish pool state changes that follow from group transitions
    fn spawn_pool_state_watcher(self: &Arc<Self>) {
        let pools = self.pools.clone();
        let shutdown = self.shutdown.clone();
        let mut events = self.events.subscribe();
        self.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(StorageEvent::GroupStateChanged { group, .. }) => {
                        pools.on_group_changed(&group)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Pool state watcher missed {} events, refreshing all", missed);
                        for pool in pools.list_pools() {
                            pools.refresh_state(&pool.id);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // =========================================================================
    // Events & Health
    // =========================================================================

    /// Subscribe to every state change
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Scan disks now instead of waiting for the next poll
    pub async fn poll_health(&self) -> Result<PollReport> {
        self.health.poll_once().await
    }

    pub fn get_health_events(&self, since: Option<DateTime<Utc>>) -> Vec<HealthEvent> {
        self.health.get_health_events(since)
    }

    // =========================================================================
    // Disks & Groups
    // =========================================================================

    pub fn list_disks(&self) -> Vec<Disk> {
        self.inventory.list_disks()
    }

    pub fn get_disk(&self, id: &DiskId) -> Result<Disk> {
        self.inventory.get_disk(id)
    }

    pub fn create_group(&self, layout: RaidLayout, disks: Vec<DiskId>) -> Result<RedundancyGroup> {
        self.raid.create_group(layout, disks)
    }

    pub fn list_groups(&self) -> Vec<RedundancyGroup> {
        self.raid.list_groups()
    }

    pub fn get_group(&self, id: &GroupId) -> Result<RedundancyGroup> {
        self.raid.get_group(id)
    }

    pub fn replace_member(&self, group: &GroupId, old: &DiskId, new: &DiskId) -> Result<TaskHandle> {
        self.raid.replace_member(group, old, new)
    }

    pub fn scrub_group(&self, group: &GroupId) -> Result<TaskHandle> {
        self.raid.scrub_group(group)
    }

    pub fn deactivate_group(&self, group: &GroupId) -> Result<RedundancyGroup> {
        self.raid.deactivate_group(group)
    }

    pub fn activate_group(&self, group: &GroupId) -> Result<RedundancyGroup> {
        self.raid.activate_group(group)
    }

    pub fn delete_group(&self, group: &GroupId) -> Result<RedundancyGroup> {
        self.raid.delete_group(group)
    }

    pub fn add_spare(&self, disk: &DiskId) -> Result<Disk> {
        self.raid.add_spare(disk)
    }

    pub fn remove_spare(&self, disk: &DiskId) -> Result<Disk> {
        self.raid.remove_spare(disk)
    }

    /// Report a member as failed outside of health polling
    pub fn handle_member_failure(&self, disk: &DiskId) -> Result<()> {
        self.raid.handle_member_failure(disk)
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub fn create_pool(&self, name: &str, groups: Vec<GroupId>) -> Result<(StoragePool, TaskHandle)> {
        self.pools.create_pool(name, groups)
    }

    pub fn expand_pool(&self, pool: &PoolId, groups: Vec<GroupId>) -> Result<(StoragePool, TaskHandle)> {
        self.pools.expand_pool(pool, groups)
    }

    pub fn delete_pool(&self, pool: &PoolId) -> Result<StoragePool> {
        self.pools.delete_pool(pool)
    }

    pub fn list_pools(&self) -> Vec<StoragePool> {
        self.pools.list_pools()
    }

    pub fn get_pool(&self, pool: &PoolId) -> Result<StoragePool> {
        self.pools.get_pool(pool)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn create_volume(&self, pool: &PoolId, name: &str, size_bytes: u64) -> Result<(Volume, TaskHandle)> {
        self.volumes.create_volume(pool, name, size_bytes)
    }

    pub fn resize_volume(&self, volume: &VolumeId, size_bytes: u64) -> Result<(Volume, Option<TaskHandle>)> {
        self.volumes.resize_volume(volume, size_bytes)
    }

    pub fn delete_volume(&self, volume: &VolumeId) -> Result<(Volume, TaskHandle)> {
        self.volumes.delete_volume(volume)
    }

    pub fn set_quota(&self, volume: &VolumeId, quota_bytes: Option<u64>) -> Result<Volume> {
        self.volumes.set_quota(volume, quota_bytes)
    }

    pub fn record_usage(&self, volume: &VolumeId, used_bytes: u64) -> Result<Volume> {
        self.volumes.record_usage(volume, used_bytes)
    }

    pub fn mount_volume(&self, volume: &VolumeId) -> Result<Volume> {
        self.volumes.mount_volume(volume)
    }

    pub fn unmount_volume(&self, volume: &VolumeId) -> Result<Volume> {
        self.volumes.unmount_volume(volume)
    }

    pub fn list_volumes(&self, pool: Option<&PoolId>) -> Vec<Volume> {
        self.volumes.list_volumes(pool)
    }

    pub fn get_volume(&self, volume: &VolumeId) -> Result<Volume> {
        self.volumes.get_volume(volume)
    }

    pub fn resolve_mount_path(&self, volume: &VolumeId) -> Result<PathBuf> {
        self.volumes.resolve_mount_path(volume)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.scheduler.list_tasks(filter)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.scheduler.get_task(id)
    }

    pub fn cancel_task(&self, id: &TaskId) -> Result<Task> {
        self.scheduler.cancel(id)
    }

    pub fn pause_task(&self, id: &TaskId) -> Result<Task> {
        self.scheduler.pause(id)
    }

    pub fn resume_task(&self, id: &TaskId) -> Result<Task> {
        self.scheduler.resume_paused(id)
    }

    /// Wait until a task is terminal
    pub async fn wait_task(&self, id: &TaskId) -> Result<Task> {
        self.scheduler.wait(id).await
    }
}
