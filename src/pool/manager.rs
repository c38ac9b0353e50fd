//! Storage Pool Manager
//!
//! Creates, expands and deletes pools over redundancy groups and keeps the
//! pool allocation counters. Every allocation is decided under the pool's
//! entity lock, so two concurrent volume requests can never both fit into
//! the same free space.

use crate::config::PoolConfig;
use crate::domain::arena::EntityArena;
use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::types::{format_bytes, GroupId, PoolId, VolumeId};
use crate::error::{Error, Result};
use crate::pool::model::{PoolState, StoragePool};
use crate::raid::RaidEngine;
use crate::scheduler::{TaskHandle, TaskOperation, TaskOutcome, TaskScheduler, TaskTarget};
use crate::store::{self, MetadataStore, RecordKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pool registry and allocator
pub struct PoolManager {
    config: PoolConfig,
    raid: Arc<RaidEngine>,
    scheduler: Arc<TaskScheduler>,
    pools: EntityArena<PoolId, StoragePool>,
    names: DashMap<String, PoolId>,
    events: EventBus,
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools.len())
            .finish()
    }
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        lock_timeout: Duration,
        raid: Arc<RaidEngine>,
        scheduler: Arc<TaskScheduler>,
        events: EventBus,
        store: Arc<dyn MetadataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            raid,
            scheduler,
            pools: EntityArena::new("pool", lock_timeout),
            names: DashMap::new(),
            events,
            store,
        })
    }

    /// Reload persisted pools
    ///
    /// A pool whose own record is unreadable, or that references an
    /// unreadable group, is kept as a FAILED stand-in so its groups and
    /// volumes stay accounted for while every other pool keeps serving.
    pub fn restore(&self, corrupt_groups: &[String]) -> Result<Vec<PoolId>> {
        let corrupt_groups: HashSet<&str> = corrupt_groups.iter().map(String::as_str).collect();
        let mut failed = Vec::new();

        for (key, body) in self.store.load_all(RecordKind::Pool)? {
            let mut pool = match store::decode::<StoragePool>(RecordKind::Pool, &key, &body) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("{}", e);
                    let id = PoolId::new(key.as_str());
                    let groups: IndexSet<GroupId> = self
                        .raid
                        .list_groups()
                        .into_iter()
                        .filter(|g| g.pool.as_ref() == Some(&id))
                        .map(|g| g.id)
                        .collect();
                    StoragePool::corrupt(id, groups, e.to_string())
                }
            };

            if pool.corrupted.is_none() {
                let bad = pool
                    .all_groups()
                    .find(|g| corrupt_groups.contains(g.as_str()))
                    .cloned();
                if let Some(bad) = bad {
                    warn!(
                        "Pool {} references unreadable group {}; marking it failed",
                        pool.id, bad
                    );
                    pool.corrupted = Some(format!("group {} metadata is unreadable", bad));
                }
            }

            pool.state = self.derive_state(&pool);
            if pool.corrupted.is_some() {
                failed.push(pool.id.clone());
            }
            self.names.insert(pool.name.clone(), pool.id.clone());
            self.pools.insert(pool.id.clone(), pool)?;
        }

        info!(
            "Restored {} pool(s), {} failed",
            self.pools.len(),
            failed.len()
        );
        Ok(failed)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn list_pools(&self) -> Vec<StoragePool> {
        self.pools
            .snapshots()
            .into_iter()
            .map(|mut pool| {
                pool.state = self.derive_state(&pool);
                pool
            })
            .collect()
    }

    pub fn get_pool(&self, id: &PoolId) -> Result<StoragePool> {
        let mut pool = self.pools.snapshot(id)?;
        pool.state = self.derive_state(&pool);
        Ok(pool)
    }

    pub fn pool_state(&self, id: &PoolId) -> Result<PoolState> {
        Ok(self.get_pool(id)?.state)
    }

    fn derive_state(&self, pool: &StoragePool) -> PoolState {
        let states: Vec<_> = pool
            .groups
            .iter()
            .map(|g| self.raid.get_group(g).ok().map(|g| g.state))
            .collect();
        pool.derive_state(&states)
    }

    // =========================================================================
    // Pool Lifecycle
    // =========================================================================

    /// Create a pool over groups and start its initialization
    pub fn create_pool(
        &self,
        name: &str,
        groups: Vec<GroupId>,
    ) -> Result<(StoragePool, TaskHandle)> {
        let ids: IndexSet<GroupId> = groups.into_iter().collect();
        if ids.is_empty() {
            return Err(Error::EmptyPool);
        }

        let list: Vec<GroupId> = ids.iter().cloned().collect();
        self.raid.check_attachable(&list)?;

        let id = PoolId::generate();
        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidState {
                    entity: format!("pool/{}", name),
                    reason: "a pool with this name already exists".into(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }
        let attached = match self.raid.attach_to_pool(&list, &id) {
            Ok(attached) => attached,
            Err(e) => {
                self.names.remove(name);
                return Err(e);
            }
        };
        let total: u64 = attached.iter().map(|g| g.usable_capacity()).sum();
        let pool = StoragePool::new(
            id.clone(),
            name,
            ids,
            total,
            self.config.reserved_margin(total),
        );

        self.save(&pool);
        self.pools.insert(id.clone(), pool.clone())?;

        let operation = TaskOperation::PoolCreate {
            pool: id.clone(),
            groups: list.clone(),
        };
        let handle = match self.scheduler.submit(operation) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.pools.remove(&id);
                store::forget(&*self.store, RecordKind::Pool, id.as_str());
                self.raid.detach_from_pool(&list, &id);
                self.forget_name(&pool);
                return Err(e);
            }
        };

        info!(
            "Created pool {} ({}) over {} group(s), {} usable (task {})",
            name,
            id,
            list.len(),
            format_bytes(total),
            handle.id()
        );
        self.events.publish(StorageEvent::PoolCreated {
            pool: id,
            name: name.to_string(),
        });

        Ok((pool, handle))
    }

    /// Attach more groups; capacity grows once the expansion task succeeds
    pub fn expand_pool(
        &self,
        id: &PoolId,
        groups: Vec<GroupId>,
    ) -> Result<(StoragePool, TaskHandle)> {
        let ids: IndexSet<GroupId> = groups.into_iter().collect();
        if ids.is_empty() {
            return Err(Error::EmptyPool);
        }
        let state = self.pool_state(id)?;
        if !state.accepts_allocations() {
            return Err(Error::TargetUnavailable {
                target: format!("pool/{}", id),
                reason: format!("pool is {}", state),
            });
        }

        let list: Vec<GroupId> = ids.iter().cloned().collect();
        self.raid.check_attachable(&list)?;
        self.raid.attach_to_pool(&list, id)?;

        let pool = match self.pools.with(id, |p| {
            p.pending_groups.extend(list.iter().cloned());
            self.save(p);
            Ok(p.clone())
        }) {
            Ok(pool) => pool,
            Err(e) => {
                self.raid.detach_from_pool(&list, id);
                return Err(e);
            }
        };

        let operation = TaskOperation::PoolExpand {
            pool: id.clone(),
            groups: list.clone(),
        };
        match self.scheduler.submit(operation) {
            Ok(handle) => {
                info!(
                    "Expanding pool {} by {} group(s) (task {})",
                    id,
                    list.len(),
                    handle.id()
                );
                Ok((pool, handle))
            }
            Err(e) => {
                self.complete_expand(id, &list, &TaskOutcome::Cancelled)?;
                Err(e)
            }
        }
    }

    /// Delete a pool that owns no volumes, releasing its groups
    pub fn delete_pool(&self, id: &PoolId) -> Result<StoragePool> {
        if self.scheduler.has_active(&TaskTarget::Pool(id.clone())) {
            return Err(Error::InvalidState {
                entity: format!("pool/{}", id),
                reason: "pool has active tasks".into(),
            });
        }

        let pool = self.pools.remove_with(id, |p| {
            if p.volumes.is_empty() {
                Ok(())
            } else {
                Err(Error::PoolNotEmpty {
                    pool: p.id.to_string(),
                    volumes: p.volumes.len(),
                })
            }
        })?;

        let groups: Vec<GroupId> = pool.all_groups().cloned().collect();
        self.raid.detach_from_pool(&groups, id);
        store::forget(&*self.store, RecordKind::Pool, id.as_str());
        self.forget_name(&pool);

        info!("Deleted pool {} ({})", pool.name, id);
        self.events.publish(StorageEvent::PoolDeleted { pool: id.clone() });
        Ok(pool)
    }

    // =========================================================================
    // Task Completion
    // =========================================================================

    /// Commit or roll back pool initialization
    pub(crate) fn complete_create(&self, id: &PoolId, outcome: &TaskOutcome) -> Result<()> {
        if outcome.is_success() {
            let result = self.pools.with(id, |p| {
                p.initialized = true;
                self.save(p);
                Ok(())
            });
            return match result {
                Ok(()) => {
                    info!("Pool {} initialized", id);
                    self.refresh_state(id);
                    Ok(())
                }
                Err(Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let pool = match self.pools.remove(id) {
            Ok(pool) => pool,
            Err(Error::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        let groups: Vec<GroupId> = pool.all_groups().cloned().collect();
        self.raid.detach_from_pool(&groups, id);
        store::forget(&*self.store, RecordKind::Pool, id.as_str());
        self.forget_name(&pool);

        warn!("Pool {} initialization did not complete; pool removed", id);
        self.events.publish(StorageEvent::PoolDeleted { pool: id.clone() });
        Ok(())
    }

    /// Commit or roll back an expansion
    pub(crate) fn complete_expand(
        &self,
        id: &PoolId,
        groups: &[GroupId],
        outcome: &TaskOutcome,
    ) -> Result<()> {
        if outcome.is_success() {
            let added: u64 = groups
                .iter()
                .filter_map(|g| self.raid.get_group(g).ok())
                .map(|g| g.usable_capacity())
                .sum();

            let result = self.pools.with(id, |p| {
                let mut committed = 0;
                for group in groups {
                    if p.pending_groups.shift_remove(group) {
                        p.groups.insert(group.clone());
                        committed += 1;
                    }
                }
                if committed > 0 {
                    p.total_capacity += added;
                    p.reserved = self.config.reserved_margin(p.total_capacity);
                    self.save(p);
                }
                Ok((p.total_capacity, p.allocated, committed))
            });

            return match result {
                Ok((total, allocated, committed)) if committed > 0 => {
                    info!("Pool {} expanded to {}", id, format_bytes(total));
                    self.events.publish(StorageEvent::PoolCapacityChanged {
                        pool: id.clone(),
                        total_bytes: total,
                        allocated_bytes: allocated,
                    });
                    self.refresh_state(id);
                    Ok(())
                }
                Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let result = self.pools.with(id, |p| {
            for group in groups {
                p.pending_groups.shift_remove(group);
            }
            self.save(p);
            Ok(())
        });
        match result {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.raid.detach_from_pool(groups, id);
        warn!("Expansion of pool {} did not complete; groups released", id);
        Ok(())
    }

    /// Recompute a pool's state and publish a change
    pub(crate) fn refresh_state(&self, id: &PoolId) {
        let Ok(snapshot) = self.pools.snapshot(id) else {
            return;
        };
        let next = self.derive_state(&snapshot);
        if next == snapshot.state {
            return;
        }

        let result = self.pools.with(id, |p| {
            let from = p.state;
            p.state = next;
            self.save(p);
            Ok(from)
        });
        match result {
            Ok(from) if from != next => {
                info!("Pool {} state {} -> {}", id, from, next);
                self.events.publish(StorageEvent::PoolStateChanged {
                    pool: id.clone(),
                    from,
                    to: next,
                });
            }
            Ok(_) => {}
            Err(e) => debug!("Pool {} state refresh skipped: {}", id, e),
        }
    }

    /// Recompute the state of the pool that owns `group`
    pub(crate) fn on_group_changed(&self, group: &GroupId) {
        for pool in self.pools.snapshots() {
            if pool.all_groups().any(|g| g == group) {
                self.refresh_state(&pool.id);
            }
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Reserve space for a volume under the pool lock
    pub(crate) fn allocate(&self, id: &PoolId, volume: &VolumeId, bytes: u64) -> Result<StoragePool> {
        let pool = self.pools.with(id, |p| {
            let state = self.derive_state(p);
            if !p.initialized || !state.accepts_allocations() {
                return Err(Error::TargetUnavailable {
                    target: format!("pool/{}", p.id),
                    reason: format!("pool is {}", state),
                });
            }
            let available = p.free_bytes();
            if bytes > available {
                return Err(Error::InsufficientFreeSpace {
                    requested: bytes,
                    available,
                });
            }
            p.allocated += bytes;
            p.volumes.insert(volume.clone());
            self.save(p);
            Ok(p.clone())
        })?;

        debug!(
            "Pool {} allocated {} for {} ({} free)",
            id,
            format_bytes(bytes),
            volume,
            format_bytes(pool.free_bytes())
        );
        self.publish_capacity(&pool);
        Ok(pool)
    }

    /// Return space to the pool; `detach` also forgets the volume
    pub(crate) fn release(&self, id: &PoolId, volume: &VolumeId, bytes: u64, detach: bool) -> Result<()> {
        let pool = self.pools.with(id, |p| {
            p.allocated = p.allocated.saturating_sub(bytes);
            if detach {
                p.volumes.remove(volume);
            }
            self.save(p);
            Ok(p.clone())
        })?;
        debug!("Pool {} released {} from {}", id, format_bytes(bytes), volume);
        self.publish_capacity(&pool);
        Ok(())
    }

    fn publish_capacity(&self, pool: &StoragePool) {
        self.events.publish(StorageEvent::PoolCapacityChanged {
            pool: pool.id.clone(),
            total_bytes: pool.total_capacity,
            allocated_bytes: pool.allocated,
        });
    }

    /// Pools left initializing or expanding without a live task
    pub(crate) fn resume_stalled(&self) -> usize {
        let mut resumed = 0;
        for pool in self.pools.snapshots() {
            if pool.corrupted.is_some() {
                continue;
            }
            let live = self.scheduler.active_tasks(&TaskTarget::Pool(pool.id.clone()));

            if !pool.initialized
                && !live
                    .iter()
                    .any(|t| matches!(t.operation, TaskOperation::PoolCreate { .. }))
            {
                let operation = TaskOperation::PoolCreate {
                    pool: pool.id.clone(),
                    groups: pool.groups.iter().cloned().collect(),
                };
                match self.scheduler.submit(operation) {
                    Ok(_) => resumed += 1,
                    Err(e) => warn!("Could not restart initialization of pool {}: {}", pool.id, e),
                }
            }

            let covered: HashSet<&GroupId> = live
                .iter()
                .filter_map(|t| match &t.operation {
                    TaskOperation::PoolExpand { groups, .. } => Some(groups.iter()),
                    _ => None,
                })
                .flatten()
                .collect();
            let orphaned: Vec<GroupId> = pool
                .pending_groups
                .iter()
                .filter(|g| !covered.contains(g))
                .cloned()
                .collect();
            if !orphaned.is_empty() {
                let operation = TaskOperation::PoolExpand {
                    pool: pool.id.clone(),
                    groups: orphaned,
                };
                match self.scheduler.submit(operation) {
                    Ok(_) => resumed += 1,
                    Err(e) => warn!("Could not restart expansion of pool {}: {}", pool.id, e),
                }
            }
        }
        resumed
    }

    fn save(&self, pool: &StoragePool) {
        store::persist(&*self.store, RecordKind::Pool, pool.id.as_str(), pool);
    }

    fn forget_name(&self, pool: &StoragePool) {
        self.names.remove_if(&pool.name, |_, owner| owner == &pool.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{Scripted, SimulatedBackend, SimulatedBackendConfig};
    use crate::config::{RaidConfig, SchedulerConfig};
    use crate::domain::types::DiskId;
    use crate::hardware::inventory::tests::sample;
    use crate::hardware::DiskInventory;
    use crate::raid::{GroupState, RaidLayout};
    use crate::scheduler::{TaskKind, TaskState};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    pub(crate) struct Harness {
        pub(crate) pools: Arc<PoolManager>,
        pub(crate) raid: Arc<RaidEngine>,
        pub(crate) inventory: Arc<DiskInventory>,
        pub(crate) scheduler: Arc<TaskScheduler>,
        pub(crate) backend: Arc<SimulatedBackend>,
        pub(crate) events: EventBus,
        pub(crate) store: Arc<dyn MetadataStore>,
        pub(crate) completions: crate::scheduler::CompletionReceiver,
    }

    pub(crate) fn harness(disks: usize, capacity: u64) -> Harness {
        let events = EventBus::new(1024);
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let inventory = DiskInventory::new(events.clone(), store.clone());
        let backend = Arc::new(SimulatedBackend::new(SimulatedBackendConfig {
            steps: 3,
            step_delay_ms: 1,
        }));
        let (scheduler, completions) = TaskScheduler::start(
            SchedulerConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..SchedulerConfig::default()
            },
            backend.clone(),
            store.clone(),
            events.clone(),
        );
        let raid = RaidEngine::new(
            RaidConfig {
                auto_replace_with_spares: false,
                ..RaidConfig::default()
            },
            Duration::from_millis(200),
            inventory.clone(),
            scheduler.clone(),
            events.clone(),
            store.clone(),
        );
        let pools = PoolManager::new(
            PoolConfig {
                metadata_reserve_ratio: 0.01,
                min_metadata_reserve_bytes: 0,
            },
            Duration::from_millis(200),
            raid.clone(),
            scheduler.clone(),
            events.clone(),
            store.clone(),
        );
        for i in 0..disks {
            inventory.register(sample(&format!("d{}", i), capacity));
        }
        Harness {
            pools,
            raid,
            inventory,
            scheduler,
            backend,
            events,
            store,
            completions,
        }
    }

    impl Harness {
        pub(crate) fn mirror(&self, a: usize, b: usize) -> GroupId {
            self.raid
                .create_group(
                    RaidLayout::Mirror,
                    vec![DiskId::new(format!("d{}", a)), DiskId::new(format!("d{}", b))],
                )
                .unwrap()
                .id
        }

        /// Route pool completions until `handle` finishes
        async fn settle(&mut self, handle: TaskHandle) -> crate::scheduler::Task {
            let id = handle.id().clone();
            loop {
                let completion = self.completions.recv().await.unwrap();
                match &completion.task.operation {
                    TaskOperation::PoolCreate { pool, .. } => {
                        self.pools.complete_create(pool, &completion.outcome).unwrap()
                    }
                    TaskOperation::PoolExpand { pool, groups } => self
                        .pools
                        .complete_expand(pool, groups, &completion.outcome)
                        .unwrap(),
                    _ => {}
                }
                let done = completion.task.id == id;
                completion.acknowledge();
                if done {
                    return handle.wait().await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_create_pool_requires_groups() {
        let h = harness(2, 1000);
        assert_matches!(h.pools.create_pool("tank", vec![]), Err(Error::EmptyPool));
        assert_matches!(
            h.pools.create_pool("tank", vec![GroupId::new("nope")]),
            Err(Error::NotFound { kind: "group", .. })
        );
        assert!(h.pools.list_pools().is_empty());
    }

    #[tokio::test]
    async fn test_create_pool_initializes() {
        let mut h = harness(4, 1000);
        let g1 = h.mirror(0, 1);
        let g2 = h.mirror(2, 3);

        let (pool, handle) = h.pools.create_pool("tank", vec![g1.clone(), g2]).unwrap();
        assert_eq!(pool.total_capacity, 2000);
        assert_eq!(h.pools.pool_state(&pool.id).unwrap(), PoolState::Initializing);
        assert_eq!(h.raid.get_group(&g1).unwrap().pool, Some(pool.id.clone()));

        // Not allocatable until initialized
        assert_matches!(
            h.pools.allocate(&pool.id, &VolumeId::new("v"), 10),
            Err(Error::TargetUnavailable { .. })
        );

        assert_eq!(h.settle(handle).await.state, TaskState::Succeeded);
        assert_eq!(h.pools.pool_state(&pool.id).unwrap(), PoolState::Online);

        // A group can only belong to one pool
        assert_matches!(
            h.pools.create_pool("other", vec![g1]),
            Err(Error::GroupInUse { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_initialization_releases_groups() {
        let mut h = harness(2, 1000);
        let g1 = h.mirror(0, 1);
        h.backend.fail_next(TaskKind::PoolCreate, Scripted::Permanent);

        let (pool, handle) = h.pools.create_pool("tank", vec![g1.clone()]).unwrap();
        assert_eq!(h.settle(handle).await.state, TaskState::Failed);

        assert_matches!(h.pools.get_pool(&pool.id), Err(Error::NotFound { .. }));
        assert_eq!(h.raid.get_group(&g1).unwrap().pool, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_with_same_name() {
        let h = harness(8, 1000);
        let groups = vec![h.mirror(0, 1), h.mirror(2, 3), h.mirror(4, 5), h.mirror(6, 7)];
        let barrier = Arc::new(tokio::sync::Barrier::new(groups.len()));

        let mut joins = Vec::with_capacity(groups.len());
        for group in groups {
            let pools = h.pools.clone();
            let barrier = barrier.clone();
            joins.push(tokio::spawn(async move {
                barrier.wait().await;
                pools.create_pool("tank", vec![group]).map(|(pool, _)| pool)
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
        assert_eq!(h.pools.list_pools().len(), 1);
        assert_eq!(
            h.raid.list_groups().iter().filter(|g| g.pool.is_some()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_pool_name_is_released_on_delete() {
        let mut h = harness(4, 1000);
        let g1 = h.mirror(0, 1);
        let g2 = h.mirror(2, 3);
        let (pool, handle) = h.pools.create_pool("tank", vec![g1]).unwrap();
        h.settle(handle).await;

        assert_matches!(
            h.pools.create_pool("tank", vec![g2.clone()]),
            Err(Error::InvalidState { .. })
        );
        assert_eq!(h.raid.get_group(&g2).unwrap().pool, None);

        h.pools.delete_pool(&pool.id).unwrap();
        let (_, handle) = h.pools.create_pool("tank", vec![g2]).unwrap();
        assert_eq!(h.settle(handle).await.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_pool_not_online_group_rejected() {
        let h = harness(2, 1000);
        let g1 = h.mirror(0, 1);
        h.raid.deactivate_group(&g1).unwrap();
        assert_matches!(
            h.pools.create_pool("tank", vec![g1]),
            Err(Error::GroupNotOnline { .. })
        );
    }

    #[tokio::test]
    async fn test_expand_grows_capacity_on_success() {
        let mut h = harness(4, 1000);
        let g1 = h.mirror(0, 1);
        let g2 = h.mirror(2, 3);
        let (pool, handle) = h.pools.create_pool("tank", vec![g1]).unwrap();
        h.settle(handle).await;

        let (expanding, handle) = h.pools.expand_pool(&pool.id, vec![g2.clone()]).unwrap();
        assert_eq!(expanding.total_capacity, 1000);
        assert!(expanding.pending_groups.contains(&g2));

        h.settle(handle).await;
        let pool = h.pools.get_pool(&pool.id).unwrap();
        assert_eq!(pool.total_capacity, 2000);
        assert_eq!(pool.groups.len(), 2);
        assert!(pool.pending_groups.is_empty());
        assert_eq!(pool.reserved, 20);
    }

    #[tokio::test]
    async fn test_cancelled_expansion_releases_groups() {
        let mut h = harness(4, 1000);
        let g1 = h.mirror(0, 1);
        let g2 = h.mirror(2, 3);
        let (pool, handle) = h.pools.create_pool("tank", vec![g1]).unwrap();
        h.settle(handle).await;

        h.backend.hold(TaskKind::PoolExpand);
        let (_, handle) = h.pools.expand_pool(&pool.id, vec![g2.clone()]).unwrap();
        h.backend.wait_for_arrivals(TaskKind::PoolExpand, 1).await;
        h.scheduler.cancel(handle.id()).unwrap();

        assert_eq!(h.settle(handle).await.state, TaskState::Cancelled);
        let pool = h.pools.get_pool(&pool.id).unwrap();
        assert_eq!(pool.total_capacity, 1000);
        assert!(pool.pending_groups.is_empty());
        assert_eq!(h.raid.get_group(&g2).unwrap().pool, None);
    }

    #[tokio::test]
    async fn test_allocation_respects_reserve() {
        let mut h = harness(2, 1000);
        let g1 = h.mirror(0, 1);
        let (pool, handle) = h.pools.create_pool("tank", vec![g1]).unwrap();
        h.settle(handle).await;

        // 1000 total, 10 reserved
        h.pools.allocate(&pool.id, &VolumeId::new("a"), 600).unwrap();
        assert_matches!(
            h.pools.allocate(&pool.id, &VolumeId::new("b"), 391),
            Err(Error::InsufficientFreeSpace {
                requested: 391,
                available: 390
            })
        );
        h.pools.allocate(&pool.id, &VolumeId::new("b"), 390).unwrap();

        assert_matches!(
            h.pools.delete_pool(&pool.id),
            Err(Error::PoolNotEmpty { volumes: 2, .. })
        );

        h.pools.release(&pool.id, &VolumeId::new("a"), 600, true).unwrap();
        h.pools.release(&pool.id, &VolumeId::new("b"), 390, true).unwrap();
        let deleted = h.pools.delete_pool(&pool.id).unwrap();
        assert_eq!(deleted.allocated, 0);
    }

    #[tokio::test]
    async fn test_pool_state_follows_groups() {
        let mut h = harness(4, 1000);
        let g1 = h.mirror(0, 1);
        let g2 = h.mirror(2, 3);
        let (pool, handle) = h.pools.create_pool("tank", vec![g1, g2]).unwrap();
        h.settle(handle).await;

        let d0 = DiskId::new("d0");
        h.inventory
            .set_health(&d0, crate::hardware::DiskHealth::Failed)
            .unwrap();
        h.raid.handle_member_failure(&d0).unwrap();
        assert_eq!(h.pools.pool_state(&pool.id).unwrap(), PoolState::Degraded);

        let d1 = DiskId::new("d1");
        h.inventory
            .set_health(&d1, crate::hardware::DiskHealth::Failed)
            .unwrap();
        h.raid.handle_member_failure(&d1).unwrap();
        assert_eq!(h.pools.pool_state(&pool.id).unwrap(), PoolState::Failed);
        assert_matches!(
            h.pools.allocate(&pool.id, &VolumeId::new("v"), 1),
            Err(Error::TargetUnavailable { .. })
        );
        assert_eq!(
            h.raid.list_groups().iter().filter(|g| g.state == GroupState::Failed).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_corrupt_group_fails_only_its_pool() {
        let mut h = harness(4, 1000);
        let g1 = h.mirror(0, 1);
        let g2 = h.mirror(2, 3);
        let (p1, handle) = h.pools.create_pool("one", vec![g1.clone()]).unwrap();
        h.settle(handle).await;
        let (p2, handle) = h.pools.create_pool("two", vec![g2]).unwrap();
        h.settle(handle).await;

        let restored = PoolManager::new(
            PoolConfig::default(),
            Duration::from_millis(200),
            h.raid.clone(),
            h.scheduler.clone(),
            h.events.clone(),
            h.store.clone(),
        );
        let failed = restored.restore(&[g1.to_string()]).unwrap();
        assert_eq!(failed, vec![p1.id.clone()]);
        assert_eq!(restored.pool_state(&p1.id).unwrap(), PoolState::Failed);
        assert_eq!(restored.pool_state(&p2.id).unwrap(), PoolState::Online);
    }
}
