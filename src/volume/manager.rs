//! Volume Manager
//!
//! Carves filesystem volumes out of pools. Space is reserved in the pool
//! before a task starts and returned if the task does not succeed, so a
//! volume never occupies space it does not hold and a failed create leaves
//! nothing behind.

use crate::config::VolumeConfig;
use crate::domain::arena::EntityArena;
use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::types::{format_bytes, PoolId, VolumeId};
use crate::error::{Error, Result};
use crate::pool::PoolManager;
use crate::scheduler::{TaskHandle, TaskOperation, TaskOutcome, TaskScheduler, TaskTarget};
use crate::store::{self, MetadataStore, RecordKind};
use crate::volume::model::{Volume, VolumeState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Volume registry and lifecycle
pub struct VolumeManager {
    config: VolumeConfig,
    pools: Arc<PoolManager>,
    scheduler: Arc<TaskScheduler>,
    volumes: EntityArena<VolumeId, Volume>,
    /// Volume names claimed per pool
    names: DashMap<(PoolId, String), VolumeId>,
    events: EventBus,
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("volumes", &self.volumes.len())
            .finish()
    }
}

impl VolumeManager {
    pub fn new(
        config: VolumeConfig,
        lock_timeout: Duration,
        pools: Arc<PoolManager>,
        scheduler: Arc<TaskScheduler>,
        events: EventBus,
        store: Arc<dyn MetadataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pools,
            scheduler,
            volumes: EntityArena::new("volume", lock_timeout),
            names: DashMap::new(),
            events,
            store,
        })
    }

    /// Reload persisted volumes; unreadable records are skipped
    pub fn restore(&self) -> Result<usize> {
        for (key, body) in self.store.load_all(RecordKind::Volume)? {
            match store::decode::<Volume>(RecordKind::Volume, &key, &body) {
                Ok(volume) => {
                    self.names
                        .insert((volume.pool.clone(), volume.name.clone()), volume.id.clone());
                    self.volumes.insert(volume.id.clone(), volume)?
                }
                Err(e) => warn!("Skipping volume record: {}", e),
            }
        }
        info!("Restored {} volume(s)", self.volumes.len());
        Ok(self.volumes.len())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Volumes, optionally restricted to one pool
    pub fn list_volumes(&self, pool: Option<&PoolId>) -> Vec<Volume> {
        self.volumes
            .snapshots()
            .into_iter()
            .filter(|v| pool.map_or(true, |p| &v.pool == p))
            .collect()
    }

    pub fn get_volume(&self, id: &VolumeId) -> Result<Volume> {
        self.volumes.snapshot(id)
    }

    /// Where a mounted volume can be reached
    pub fn resolve_mount_path(&self, id: &VolumeId) -> Result<PathBuf> {
        let volume = self.volumes.snapshot(id)?;
        let path = match (volume.state, &volume.mount_path) {
            (VolumeState::Mounted, Some(path)) => path.clone(),
            _ => {
                return Err(Error::NotMounted {
                    volume: id.to_string(),
                })
            }
        };

        let pool_state = self.pools.pool_state(&volume.pool)?;
        if !pool_state.is_accessible() {
            return Err(Error::TargetUnavailable {
                target: format!("pool/{}", volume.pool),
                reason: format!("pool is {}", pool_state),
            });
        }
        Ok(path)
    }

    fn mount_path_for(&self, volume: &Volume) -> PathBuf {
        self.config
            .mount_root
            .join(volume.pool.as_str())
            .join(volume.id.as_str())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Reserve space and start formatting a new volume
    pub fn create_volume(
        &self,
        pool: &PoolId,
        name: &str,
        size_bytes: u64,
    ) -> Result<(Volume, TaskHandle)> {
        let pool_state = self.pools.pool_state(pool)?;
        if !pool_state.accepts_allocations() {
            return Err(Error::TargetUnavailable {
                target: format!("pool/{}", pool),
                reason: format!("pool is {}", pool_state),
            });
        }
        if size_bytes < self.config.min_volume_bytes {
            return Err(Error::InvalidState {
                entity: format!("volume/{}", name),
                reason: format!(
                    "size {} is below the minimum of {}",
                    format_bytes(size_bytes),
                    format_bytes(self.config.min_volume_bytes)
                ),
            });
        }

        let id = VolumeId::generate();
        match self.names.entry((pool.clone(), name.to_string())) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidState {
                    entity: format!("volume/{}", name),
                    reason: format!("name already used in pool {}", pool),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }
        if let Err(e) = self.pools.allocate(pool, &id, size_bytes) {
            self.names.remove(&(pool.clone(), name.to_string()));
            return Err(e);
        }

        let volume = Volume::new(id.clone(), name, pool.clone(), size_bytes);
        self.save(&volume);
        self.volumes.insert(id.clone(), volume.clone())?;
        self.publish_state(&volume, None);

        let operation = TaskOperation::VolumeCreate {
            volume: id.clone(),
            pool: pool.clone(),
            size_bytes,
        };
        match self.scheduler.submit(operation) {
            Ok(handle) => {
                info!(
                    "Creating volume {} ({}) of {} in pool {} (task {})",
                    name,
                    id,
                    format_bytes(size_bytes),
                    pool,
                    handle.id()
                );
                Ok((volume, handle))
            }
            Err(e) => {
                self.complete_create(&id, &TaskOutcome::Cancelled)?;
                Err(e)
            }
        }
    }

    /// Mount a formatted volume or discard a failed one
    pub(crate) fn complete_create(&self, id: &VolumeId, outcome: &TaskOutcome) -> Result<()> {
        if outcome.is_success() {
            let result = self.volumes.with(id, |v| {
                if v.state != VolumeState::Formatting {
                    return Ok(None);
                }
                v.state = VolumeState::Mounted;
                v.mount_path = Some(self.mount_path_for(v));
                self.save(v);
                Ok(Some(v.clone()))
            });
            return match result {
                Ok(Some(volume)) => {
                    info!("Volume {} mounted at {:?}", id, volume.mount_path);
                    self.publish_state(&volume, Some(VolumeState::Formatting));
                    Ok(())
                }
                Ok(None) | Err(Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let volume = match self.volumes.remove_with(id, |v| {
            if v.state == VolumeState::Formatting {
                Ok(())
            } else {
                Err(Error::InvalidState {
                    entity: format!("volume/{}", v.id),
                    reason: "already formatted".into(),
                })
            }
        }) {
            Ok(volume) => volume,
            Err(Error::NotFound { .. }) | Err(Error::InvalidState { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        self.forget_name(&volume);
        self.pools
            .release(&volume.pool, &volume.id, volume.size_bytes, true)?;
        store::forget(&*self.store, RecordKind::Volume, id.as_str());
        warn!("Volume {} was not created; space returned to pool {}", id, volume.pool);
        self.events.publish(StorageEvent::VolumeDeleted {
            volume: id.clone(),
            pool: volume.pool,
        });
        Ok(())
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Grow a volume; returns no task when the size is unchanged
    pub fn resize_volume(
        &self,
        id: &VolumeId,
        new_size: u64,
    ) -> Result<(Volume, Option<TaskHandle>)> {
        let (volume, from) = self.volumes.with(id, |v| {
            if new_size < v.size_bytes {
                return Err(Error::ShrinkNotSupported {
                    volume: v.id.to_string(),
                    current: v.size_bytes,
                    requested: new_size,
                });
            }
            if new_size == v.size_bytes {
                return Ok((v.clone(), None));
            }
            if v.is_busy() || v.state == VolumeState::Error {
                return Err(Error::InvalidState {
                    entity: format!("volume/{}", v.id),
                    reason: format!("volume is {} with a task in progress or failed", v.state),
                });
            }

            self.pools
                .allocate(&v.pool, &v.id, new_size - v.size_bytes)?;
            v.resizing_to = Some(new_size);
            self.save(v);
            Ok((v.clone(), Some(v.size_bytes)))
        })?;

        let Some(from) = from else {
            debug!("Volume {} already has size {}", id, new_size);
            return Ok((volume, None));
        };

        let operation = TaskOperation::VolumeResize {
            volume: id.clone(),
            pool: volume.pool.clone(),
            from_bytes: from,
            to_bytes: new_size,
        };
        match self.scheduler.submit(operation) {
            Ok(handle) => {
                info!(
                    "Resizing volume {} from {} to {} (task {})",
                    id,
                    format_bytes(from),
                    format_bytes(new_size),
                    handle.id()
                );
                Ok((volume, Some(handle)))
            }
            Err(e) => {
                self.complete_resize(id, new_size, &TaskOutcome::Cancelled)?;
                Err(e)
            }
        }
    }

    /// Commit the new size or return the reserved delta
    pub(crate) fn complete_resize(&self, id: &VolumeId, to_bytes: u64, outcome: &TaskOutcome) -> Result<()> {
        let result = self.volumes.with(id, |v| {
            if v.resizing_to != Some(to_bytes) {
                return Ok(None);
            }
            v.resizing_to = None;
            let delta = to_bytes.saturating_sub(v.size_bytes);
            if outcome.is_success() {
                v.size_bytes = to_bytes;
                self.save(v);
                Ok(Some((v.pool.clone(), 0)))
            } else {
                self.save(v);
                Ok(Some((v.pool.clone(), delta)))
            }
        });

        match result {
            Ok(Some((_, 0))) => {
                info!("Volume {} resized to {}", id, format_bytes(to_bytes));
                Ok(())
            }
            Ok(Some((pool, delta))) => {
                warn!("Resize of volume {} did not complete; size unchanged", id);
                self.pools.release(&pool, id, delta, false)
            }
            Ok(None) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Unmount a volume and start destroying it
    pub fn delete_volume(&self, id: &VolumeId) -> Result<(Volume, TaskHandle)> {
        let (volume, previous) = self.volumes.with(id, |v| {
            if v.is_busy() {
                return Err(Error::InvalidState {
                    entity: format!("volume/{}", v.id),
                    reason: format!("volume is {} with a task in progress", v.state),
                });
            }
            let previous = v.state;
            v.state = VolumeState::Unmounted;
            v.mount_path = None;
            v.deleting = true;
            v.error = None;
            self.save(v);
            Ok((v.clone(), previous))
        })?;

        if previous != VolumeState::Unmounted {
            self.publish_state(&volume, Some(previous));
        }

        let operation = TaskOperation::VolumeDelete {
            volume: id.clone(),
            pool: volume.pool.clone(),
        };
        match self.scheduler.submit(operation) {
            Ok(handle) => {
                info!("Deleting volume {} (task {})", id, handle.id());
                Ok((volume, handle))
            }
            Err(e) => {
                self.complete_delete(id, &TaskOutcome::Cancelled)?;
                Err(e)
            }
        }
    }

    /// Remove a destroyed volume or record why destruction failed
    pub(crate) fn complete_delete(&self, id: &VolumeId, outcome: &TaskOutcome) -> Result<()> {
        match outcome {
            TaskOutcome::Succeeded => {
                let volume = match self.volumes.remove(id) {
                    Ok(volume) => volume,
                    Err(Error::NotFound { .. }) => return Ok(()),
                    Err(e) => return Err(e),
                };
                self.forget_name(&volume);
                self.pools
                    .release(&volume.pool, id, volume.size_bytes, true)?;
                store::forget(&*self.store, RecordKind::Volume, id.as_str());
                info!(
                    "Volume {} deleted, {} returned to pool {}",
                    id,
                    format_bytes(volume.size_bytes),
                    volume.pool
                );
                self.events.publish(StorageEvent::VolumeDeleted {
                    volume: id.clone(),
                    pool: volume.pool,
                });
                Ok(())
            }
            TaskOutcome::Failed(reason) => {
                let result = self.volumes.with(id, |v| {
                    let previous = v.state;
                    v.deleting = false;
                    v.state = VolumeState::Error;
                    v.error = Some(reason.clone());
                    self.save(v);
                    Ok((v.clone(), previous))
                });
                match result {
                    Ok((volume, previous)) => {
                        warn!("Deleting volume {} failed: {}", id, reason);
                        self.publish_state(&volume, Some(previous));
                        Ok(())
                    }
                    Err(Error::NotFound { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            TaskOutcome::Cancelled => {
                match self.volumes.with(id, |v| {
                    v.deleting = false;
                    self.save(v);
                    Ok(())
                }) {
                    Ok(()) | Err(Error::NotFound { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    // =========================================================================
    // Mount, Quota, Usage
    // =========================================================================

    /// Mount an unmounted volume
    pub fn mount_volume(&self, id: &VolumeId) -> Result<Volume> {
        let pool_state = self.pools.pool_state(&self.volumes.snapshot(id)?.pool)?;
        let (volume, previous) = self.volumes.with(id, |v| {
            match v.state {
                VolumeState::Mounted => return Ok((v.clone(), None)),
                VolumeState::Unmounted if !v.deleting => {}
                _ => {
                    return Err(Error::InvalidState {
                        entity: format!("volume/{}", v.id),
                        reason: format!("cannot mount a {} volume", v.state),
                    })
                }
            }
            if !pool_state.is_accessible() {
                return Err(Error::TargetUnavailable {
                    target: format!("pool/{}", v.pool),
                    reason: format!("pool is {}", pool_state),
                });
            }
            v.state = VolumeState::Mounted;
            v.mount_path = Some(self.mount_path_for(v));
            self.save(v);
            Ok((v.clone(), Some(VolumeState::Unmounted)))
        })?;

        if previous.is_some() {
            info!("Volume {} mounted", id);
            self.publish_state(&volume, previous);
        }
        Ok(volume)
    }

    /// Unmount a mounted volume
    pub fn unmount_volume(&self, id: &VolumeId) -> Result<Volume> {
        let (volume, changed) = self.volumes.with(id, |v| match v.state {
            VolumeState::Unmounted => Ok((v.clone(), false)),
            VolumeState::Mounted => {
                v.state = VolumeState::Unmounted;
                v.mount_path = None;
                self.save(v);
                Ok((v.clone(), true))
            }
            state => Err(Error::InvalidState {
                entity: format!("volume/{}", v.id),
                reason: format!("cannot unmount a {} volume", state),
            }),
        })?;

        if changed {
            info!("Volume {} unmounted", id);
            self.publish_state(&volume, Some(VolumeState::Mounted));
        }
        Ok(volume)
    }

    /// Set or clear the usage quota
    pub fn set_quota(&self, id: &VolumeId, quota_bytes: Option<u64>) -> Result<Volume> {
        let volume = self.volumes.with(id, |v| {
            if let Some(quota) = quota_bytes {
                if quota > v.size_bytes {
                    return Err(Error::InvalidState {
                        entity: format!("volume/{}", v.id),
                        reason: format!(
                            "quota {} exceeds volume size {}",
                            format_bytes(quota),
                            format_bytes(v.size_bytes)
                        ),
                    });
                }
            }
            v.quota_bytes = quota_bytes;
            self.save(v);
            Ok(v.clone())
        })?;

        if let Some(quota) = volume.quota_bytes {
            if volume.used_bytes > quota {
                self.publish_quota_exceeded(&volume, quota);
            }
        }
        Ok(volume)
    }

    /// Record filesystem usage reported for a volume
    pub fn record_usage(&self, id: &VolumeId, used_bytes: u64) -> Result<Volume> {
        let (volume, previous) = self.volumes.with(id, |v| {
            if used_bytes > v.size_bytes {
                return Err(Error::InvalidState {
                    entity: format!("volume/{}", v.id),
                    reason: format!("usage {} exceeds volume size {}", used_bytes, v.size_bytes),
                });
            }
            let previous = std::mem::replace(&mut v.used_bytes, used_bytes);
            self.save(v);
            Ok((v.clone(), previous))
        })?;

        if let Some(quota) = volume.quota_bytes {
            if previous <= quota && used_bytes > quota {
                self.publish_quota_exceeded(&volume, quota);
            }
        }
        Ok(volume)
    }

    fn publish_quota_exceeded(&self, volume: &Volume, quota: u64) {
        warn!(
            "Volume {} uses {} of its {} quota",
            volume.id,
            format_bytes(volume.used_bytes),
            format_bytes(quota)
        );
        self.events.publish(StorageEvent::VolumeQuotaExceeded {
            volume: volume.id.clone(),
            used_bytes: volume.used_bytes,
            quota_bytes: quota,
        });
    }

    // =========================================================================
    // Restart Recovery
    // =========================================================================

    /// Volumes left mid-operation without a live task get it resubmitted
    pub(crate) fn resume_stalled(&self) -> usize {
        let mut resumed = 0;
        for volume in self.volumes.snapshots() {
            let target = TaskTarget::Volume(volume.id.clone());
            if self.scheduler.has_active(&target) {
                continue;
            }

            let operation = if volume.state == VolumeState::Formatting {
                TaskOperation::VolumeCreate {
                    volume: volume.id.clone(),
                    pool: volume.pool.clone(),
                    size_bytes: volume.size_bytes,
                }
            } else if let Some(to_bytes) = volume.resizing_to {
                TaskOperation::VolumeResize {
                    volume: volume.id.clone(),
                    pool: volume.pool.clone(),
                    from_bytes: volume.size_bytes,
                    to_bytes,
                }
            } else if volume.deleting {
                TaskOperation::VolumeDelete {
                    volume: volume.id.clone(),
                    pool: volume.pool.clone(),
                }
            } else {
                continue;
            };

            match self.scheduler.submit(operation) {
                Ok(handle) => {
                    info!("Restarted {} for volume {}", handle.snapshot().kind, volume.id);
                    resumed += 1;
                }
                Err(e) => warn!("Could not restart task for volume {}: {}", volume.id, e),
            }
        }
        resumed
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn save(&self, volume: &Volume) {
        store::persist(&*self.store, RecordKind::Volume, volume.id.as_str(), volume);
    }

    fn forget_name(&self, volume: &Volume) {
        self.names
            .remove_if(&(volume.pool.clone(), volume.name.clone()), |_, owner| {
                owner == &volume.id
            });
    }

    fn publish_state(&self, volume: &Volume, from: Option<VolumeState>) {
        self.events.publish(StorageEvent::VolumeStateChanged {
            volume: volume.id.clone(),
            pool: volume.pool.clone(),
            from,
            to: volume.state,
            mount_path: volume.mount_path_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Scripted;
    use crate::pool::manager::tests::harness;
    use crate::domain::types::GroupId;
    use crate::pool::StoragePool;
    use crate::raid::RaidEngine;
    use crate::scheduler::{CompletionReceiver, TaskKind, TaskState};
    use assert_matches::assert_matches;
    use tokio::sync::Barrier;
    use tokio::task::JoinHandle;

    struct Fixture {
        volumes: Arc<VolumeManager>,
        pools: Arc<PoolManager>,
        raid: Arc<RaidEngine>,
        group: GroupId,
        backend: Arc<crate::backend::SimulatedBackend>,
        scheduler: Arc<TaskScheduler>,
        events: EventBus,
        pool: StoragePool,
        _pump: JoinHandle<()>,
    }

    fn pump(
        pools: Arc<PoolManager>,
        volumes: Arc<VolumeManager>,
        mut completions: CompletionReceiver,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(completion) = completions.recv().await {
                let outcome = &completion.outcome;
                match &completion.task.operation {
                    TaskOperation::PoolCreate { pool, .. } => {
                        pools.complete_create(pool, outcome).unwrap()
                    }
                    TaskOperation::VolumeCreate { volume, .. } => {
                        volumes.complete_create(volume, outcome).unwrap()
                    }
                    TaskOperation::VolumeResize {
                        volume, to_bytes, ..
                    } => volumes.complete_resize(volume, *to_bytes, outcome).unwrap(),
                    TaskOperation::VolumeDelete { volume, .. } => {
                        volumes.complete_delete(volume, outcome).unwrap()
                    }
                    _ => {}
                }
                completion.acknowledge();
            }
        })
    }

    /// One initialized pool of 1000 bytes with 10 reserved
    async fn fixture() -> Fixture {
        let h = harness(2, 1000);
        let group = h.mirror(0, 1);
        let volumes = VolumeManager::new(
            VolumeConfig {
                mount_root: PathBuf::from("/mnt/test"),
                min_volume_bytes: 1,
            },
            Duration::from_millis(200),
            h.pools.clone(),
            h.scheduler.clone(),
            h.events.clone(),
            h.store.clone(),
        );
        let pump = pump(h.pools.clone(), volumes.clone(), h.completions);
        let (pool, handle) = h.pools.create_pool("tank", vec![group.clone()]).unwrap();
        handle.wait().await.unwrap();
        Fixture {
            volumes,
            pools: h.pools,
            raid: h.raid,
            group,
            backend: h.backend,
            scheduler: h.scheduler,
            events: h.events,
            pool,
            _pump: pump,
        }
    }

    fn allocated(f: &Fixture) -> u64 {
        f.pools.get_pool(&f.pool.id).unwrap().allocated
    }

    #[tokio::test]
    async fn test_create_volume_mounts() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        assert_eq!(volume.state, VolumeState::Formatting);
        assert_eq!(allocated(&f), 400);
        assert_matches!(
            f.volumes.resolve_mount_path(&volume.id),
            Err(Error::NotMounted { .. })
        );

        assert_eq!(handle.wait().await.unwrap().state, TaskState::Succeeded);
        let volume = f.volumes.get_volume(&volume.id).unwrap();
        assert_eq!(volume.state, VolumeState::Mounted);
        assert_eq!(
            f.volumes.resolve_mount_path(&volume.id).unwrap(),
            PathBuf::from("/mnt/test")
                .join(f.pool.id.as_str())
                .join(volume.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_create_volume_beyond_free_space() {
        let f = fixture().await;
        assert_matches!(
            f.volumes.create_volume(&f.pool.id, "big", 991),
            Err(Error::InsufficientFreeSpace {
                requested: 991,
                available: 990
            })
        );
        assert!(f.volumes.list_volumes(None).is_empty());
        assert_eq!(allocated(&f), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_overcommit() {
        let f = fixture().await;
        let callers = 16;
        let barrier = Arc::new(Barrier::new(callers));

        let mut joins = Vec::with_capacity(callers);
        for i in 0..callers {
            let volumes = f.volumes.clone();
            let barrier = barrier.clone();
            let pool = f.pool.id.clone();
            joins.push(tokio::spawn(async move {
                barrier.wait().await;
                volumes
                    .create_volume(&pool, &format!("vol-{}", i), 100)
                    .map(|(volume, _)| volume)
            }));
        }

        let mut created = 0;
        for join in joins {
            match join.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_matches!(e, Error::InsufficientFreeSpace { .. }),
            }
        }

        // 990 free bytes hold nine 100-byte volumes
        assert_eq!(created, 9);
        let pool = f.pools.get_pool(&f.pool.id).unwrap();
        assert_eq!(pool.allocated, 900);
        assert!(pool.allocated + pool.reserved <= pool.total_capacity);
        assert_eq!(pool.volumes.len(), 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_with_same_name() {
        let f = fixture().await;
        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));

        let mut joins = Vec::with_capacity(callers);
        for _ in 0..callers {
            let volumes = f.volumes.clone();
            let barrier = barrier.clone();
            let pool = f.pool.id.clone();
            joins.push(tokio::spawn(async move {
                barrier.wait().await;
                volumes.create_volume(&pool, "media", 10).map(|(volume, _)| volume)
            }));
        }

        let mut created = 0;
        for join in joins {
            match join.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_matches!(e, Error::InvalidState { .. }),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(f.volumes.list_volumes(Some(&f.pool.id)).len(), 1);
        assert_eq!(allocated(&f), 10);
    }

    #[tokio::test]
    async fn test_name_is_reusable_after_failed_create() {
        let f = fixture().await;
        f.backend.fail_next(TaskKind::VolumeCreate, Scripted::Permanent);
        let (_, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Failed);

        let (_, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Succeeded);
        assert_matches!(
            f.volumes.create_volume(&f.pool.id, "media", 10),
            Err(Error::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn test_unavailable_pool_checked_before_size() {
        let f = fixture().await;
        f.raid.deactivate_group(&f.group).unwrap();

        assert_matches!(
            f.volumes.create_volume(&f.pool.id, "tiny", 0),
            Err(Error::TargetUnavailable { .. })
        );
        assert_matches!(
            f.volumes.create_volume(&f.pool.id, "media", 400),
            Err(Error::TargetUnavailable { .. })
        );
        assert_eq!(allocated(&f), 0);

        f.raid.activate_group(&f.group).unwrap();
        assert_matches!(
            f.volumes.create_volume(&f.pool.id, "tiny", 0),
            Err(Error::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_create_is_rolled_back() {
        let f = fixture().await;
        f.backend.fail_next(TaskKind::VolumeCreate, Scripted::Permanent);
        let mut events = f.events.subscribe();

        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Failed);

        assert_matches!(f.volumes.get_volume(&volume.id), Err(Error::NotFound { .. }));
        assert_eq!(allocated(&f), 0);
        assert!(f.pools.get_pool(&f.pool.id).unwrap().volumes.is_empty());

        let mut deleted = false;
        while let Ok(event) = events.try_recv() {
            deleted |= matches!(event, StorageEvent::VolumeDeleted { .. });
        }
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_cancelled_create_leaves_no_volume() {
        let f = fixture().await;
        f.backend.hold(TaskKind::VolumeCreate);

        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        f.backend.wait_for_arrivals(TaskKind::VolumeCreate, 1).await;
        assert_eq!(allocated(&f), 400);

        f.scheduler.cancel(handle.id()).unwrap();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Cancelled);

        assert_matches!(f.volumes.get_volume(&volume.id), Err(Error::NotFound { .. }));
        assert_eq!(allocated(&f), 0);
    }

    #[tokio::test]
    async fn test_resize_grows_and_refuses_shrink() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        assert_matches!(
            f.volumes.resize_volume(&volume.id, 300),
            Err(Error::ShrinkNotSupported { .. })
        );

        let (_, task) = f.volumes.resize_volume(&volume.id, 400).unwrap();
        assert!(task.is_none());

        let (_, task) = f.volumes.resize_volume(&volume.id, 700).unwrap();
        assert_eq!(allocated(&f), 700);
        task.unwrap().wait().await.unwrap();
        assert_eq!(f.volumes.get_volume(&volume.id).unwrap().size_bytes, 700);
    }

    #[tokio::test]
    async fn test_failed_resize_returns_delta() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        f.backend.fail_next(TaskKind::VolumeResize, Scripted::Permanent);
        let (_, task) = f.volumes.resize_volume(&volume.id, 700).unwrap();
        assert_eq!(task.unwrap().wait().await.unwrap().state, TaskState::Failed);

        let volume = f.volumes.get_volume(&volume.id).unwrap();
        assert_eq!(volume.size_bytes, 400);
        assert_eq!(volume.resizing_to, None);
        assert_eq!(allocated(&f), 400);
    }

    #[tokio::test]
    async fn test_delete_releases_space() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        let (unmounted, handle) = f.volumes.delete_volume(&volume.id).unwrap();
        assert_eq!(unmounted.state, VolumeState::Unmounted);
        handle.wait().await.unwrap();

        assert_matches!(f.volumes.get_volume(&volume.id), Err(Error::NotFound { .. }));
        assert_eq!(allocated(&f), 0);
        f.pools.delete_pool(&f.pool.id).unwrap();
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_space_and_is_retryable() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        f.backend.fail_next(TaskKind::VolumeDelete, Scripted::Permanent);
        let (_, handle) = f.volumes.delete_volume(&volume.id).unwrap();
        handle.wait().await.unwrap();

        let failed = f.volumes.get_volume(&volume.id).unwrap();
        assert_eq!(failed.state, VolumeState::Error);
        assert_eq!(allocated(&f), 400);

        let (_, handle) = f.volumes.delete_volume(&volume.id).unwrap();
        handle.wait().await.unwrap();
        assert_eq!(allocated(&f), 0);
    }

    #[tokio::test]
    async fn test_cancelled_delete_stays_unmounted() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        f.backend.hold(TaskKind::VolumeDelete);
        let (_, handle) = f.volumes.delete_volume(&volume.id).unwrap();
        f.backend.wait_for_arrivals(TaskKind::VolumeDelete, 1).await;
        f.scheduler.cancel(handle.id()).unwrap();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Cancelled);

        let volume = f.volumes.get_volume(&volume.id).unwrap();
        assert_eq!(volume.state, VolumeState::Unmounted);
        assert!(!volume.deleting);
        f.volumes.mount_volume(&volume.id).unwrap();
    }

    #[tokio::test]
    async fn test_quota_crossing_emits_once() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        assert_matches!(
            f.volumes.set_quota(&volume.id, Some(500)),
            Err(Error::InvalidState { .. })
        );
        f.volumes.set_quota(&volume.id, Some(300)).unwrap();

        let mut events = f.events.subscribe();
        f.volumes.record_usage(&volume.id, 200).unwrap();
        f.volumes.record_usage(&volume.id, 350).unwrap();
        f.volumes.record_usage(&volume.id, 360).unwrap();

        let mut exceeded = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, StorageEvent::VolumeQuotaExceeded { .. }) {
                exceeded += 1;
            }
        }
        assert_eq!(exceeded, 1);
    }

    #[tokio::test]
    async fn test_mount_toggle() {
        let f = fixture().await;
        let (volume, handle) = f.volumes.create_volume(&f.pool.id, "media", 400).unwrap();
        handle.wait().await.unwrap();

        let unmounted = f.volumes.unmount_volume(&volume.id).unwrap();
        assert_eq!(unmounted.mount_path, None);
        assert_matches!(
            f.volumes.resolve_mount_path(&volume.id),
            Err(Error::NotMounted { .. })
        );
        f.volumes.mount_volume(&volume.id).unwrap();
        assert!(f.volumes.resolve_mount_path(&volume.id).is_ok());
    }
}
